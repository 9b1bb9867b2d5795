use rstest::rstest;
use serde_json::{Number, json};

use super::*;
use crate::om::process::{ProcessType, TlsMode};

const VERSION: &str = "4.2.1";

fn mongod(name: &str) -> Process {
    Process::new_mongod(name, format!("{name}.mongodb.svc.cluster.local"), VERSION)
        .expect("version is valid")
}

fn mongos(name: &str, cluster: &str) -> Process {
    Process::new_mongos(
        name,
        format!("{name}.mongodb.svc.cluster.local"),
        VERSION,
        cluster,
    )
    .expect("version is valid")
}

fn replica_set(name: &str, members: usize) -> ReplicaSetWithProcesses {
    let processes = (0..members)
        .map(|i| mongod(&format!("{name}-{i}")))
        .collect();
    ReplicaSetWithProcesses::new(name, processes, VERSION).expect("members are mongods")
}

fn sharded_cluster(shards: usize, finalizing: bool) -> ShardedClusterMerge {
    ShardedClusterMerge {
        name: "sh".to_owned(),
        mongos_processes: (0..2).map(|i| mongos(&format!("sh-mongos-{i}"), "sh")).collect(),
        config_server: replica_set("sh-config", 3),
        shards: (0..shards).map(|i| replica_set(&format!("sh-{i}"), 3)).collect(),
        finalizing,
    }
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|&name| name.to_owned()).collect()
}

/// A replica set as it looks after the UI and the agents had their way with it.
fn customized_deployment() -> Deployment {
    Deployment::from_value(json!({
        "version": 7,
        "options": {"downloadBase": "/var/lib/mongodb-mms-automation"},
        "auth": {"disabled": true},
        "ssl": {"clientCertificateMode": "OPTIONAL"},
        "processes": [
            {
                "name": "rs-0",
                "hostname": "rs-0.mongodb.svc.cluster.local",
                "version": "4.0.0",
                "processType": "mongod",
                "logRotate": {"sizeThresholdMB": 1000, "timeThresholdHrs": 24},
                "args2_6": {
                    "net": {"port": 27017},
                    "replication": {"replSetName": "rs"},
                    "setParameter": {"ttlMonitorEnabled": false},
                },
            },
            {
                "name": "rs-1",
                "hostname": "rs-1.mongodb.svc.cluster.local",
                "version": "4.0.0",
                "processType": "mongod",
                "args2_6": {"net": {"port": 27017}, "replication": {"replSetName": "rs"}},
            },
            {
                "name": "rs-2",
                "hostname": "rs-2.mongodb.svc.cluster.local",
                "version": "4.0.0",
                "processType": "mongod",
                "args2_6": {"net": {"port": 27017}, "replication": {"replSetName": "rs"}},
            },
        ],
        "replicaSets": [{
            "_id": "rs",
            "protocolVersion": "1",
            "settings": {"chainingAllowed": false},
            "members": [
                {"_id": 0, "host": "rs-0", "votes": 1, "priority": 1, "hidden": false},
                {"_id": 1, "host": "rs-1", "votes": 1, "priority": 1},
                {"_id": 2, "host": "rs-2", "votes": 1, "priority": 1, "slaveDelay": 0},
            ],
        }],
        "monitoringVersions": [
            {"hostname": "rs-0.mongodb.svc.cluster.local", "name": "6.4.0.433-1", "logPath": "/var/log/monitoring"},
        ],
    }))
    .expect("fixture is a valid deployment")
}

#[test]
fn new_deployment_has_auth_and_tls_sections() {
    let deployment = Deployment::new();
    assert_eq!(deployment.section(AUTH_KEY), Some(&Map::new()));
    assert!(!deployment.client_certificates_required());
    assert_eq!(deployment.version(), -1);
    assert_eq!(
        deployment.to_value().expect("deployment encodes")["ssl"]["CAFilePath"],
        json!(CA_FILE_PATH)
    );
}

#[test]
fn tls_sections_are_read_as_ssl() {
    let deployment = Deployment::from_value(json!({
        "tls": {"clientCertificateMode": "REQUIRE"},
        "processes": [{
            "name": "p",
            "hostname": "p.local",
            "version": VERSION,
            "processType": "mongod",
            "args2_6": {"net": {"port": 27017, "tls": {"mode": "requireTLS"}}},
        }],
    }))
    .expect("fixture is a valid deployment");

    assert!(deployment.client_certificates_required());
    let encoded = deployment.to_value().expect("deployment encodes");
    assert_eq!(encoded.get("tls"), None);
    assert_eq!(
        encoded["processes"][0]["args2_6"]["net"]["ssl"],
        json!({"mode": "requireTLS"})
    );
    assert_eq!(encoded["processes"][0]["args2_6"]["net"].get("tls"), None);
}

#[test]
fn encoding_keeps_the_shape_of_the_document() {
    let mut deployment = customized_deployment();
    let rs = deployment.replica_set_mut("rs").expect("rs exists");
    rs.members[1].priority = Number::from_f64(0.5).expect("0.5 is finite");

    let encoded = deployment.to_value().expect("deployment encodes");
    assert_eq!(encoded.get("backupVersions"), None);
    assert_eq!(encoded["monitoringVersions"].as_array().map(Vec::len), Some(1));
    let members = &encoded["replicaSets"][0]["members"];
    assert!(members[0]["priority"].is_u64());
    assert_eq!(members[0]["priority"], json!(1));
    assert_eq!(members[1]["priority"], json!(0.5));

    deployment.remove_monitoring_and_backup(&names(&["rs-0"]));
    let encoded = deployment.to_value().expect("deployment encodes");
    assert_eq!(encoded.get("monitoringVersions"), None);
}

#[test]
fn non_object_document_is_rejected() {
    assert!(matches!(
        Deployment::from_value(json!([])),
        Err(Error::UnexpectedShape { .. })
    ));
    assert!(matches!(
        Deployment::from_slice(b"{\"processes\": {}}"),
        Err(Error::UnexpectedShape { .. })
    ));
}

#[test]
fn replica_set_is_added_to_empty_deployment() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 3));

    assert_eq!(deployment.all_process_names(), names(&["rs-0", "rs-1", "rs-2"]));
    assert_eq!(
        deployment.process_names(ResourceKind::ReplicaSet, "rs"),
        names(&["rs-0", "rs-1", "rs-2"])
    );
    assert!(deployment
        .processes
        .iter()
        .all(|process| process.replica_set_name() == Some("rs")));
}

#[test]
fn replica_set_merge_is_idempotent() {
    let mut deployment = customized_deployment();
    deployment.merge_replica_set(replica_set("rs", 3));
    let once = deployment.clone();

    deployment.merge_replica_set(replica_set("rs", 3));
    assert_eq!(deployment, once);
}

#[test]
fn replica_set_merge_preserves_external_settings() {
    let mut deployment = customized_deployment();
    deployment.merge_replica_set(replica_set("rs", 3));

    assert_eq!(deployment.version(), 7);
    assert_eq!(
        deployment.extra.get("options"),
        Some(&json!({"downloadBase": "/var/lib/mongodb-mms-automation"}))
    );
    assert_eq!(deployment.extra.get(AUTH_KEY), Some(&json!({"disabled": true})));

    let process = deployment.process("rs-0").expect("rs-0 exists");
    assert_eq!(process.version, VERSION);
    assert_eq!(
        process.extra.get("logRotate"),
        Some(&json!({"sizeThresholdMB": 1000, "timeThresholdHrs": 24}))
    );
    assert_eq!(
        process.args.get("setParameter"),
        Some(&json!({"ttlMonitorEnabled": false}))
    );

    let rs = deployment.replica_set("rs").expect("rs exists");
    assert_eq!(rs.extra.get("settings"), Some(&json!({"chainingAllowed": false})));
    assert_eq!(rs.members[0].extra.get("hidden"), Some(&json!(false)));
    assert_eq!(rs.members[2].extra.get("slaveDelay"), Some(&json!(0)));

    assert_eq!(deployment.monitoring_versions.len(), 1);
    assert_eq!(
        deployment.monitoring_versions[0].extra.get("logPath"),
        Some(&json!("/var/log/monitoring"))
    );
}

#[test]
fn scaling_up_clones_existing_customizations() {
    let mut deployment = customized_deployment();
    deployment.merge_replica_set(replica_set("rs", 5));

    assert_eq!(
        deployment.process_names(ResourceKind::ReplicaSet, "rs"),
        names(&["rs-0", "rs-1", "rs-2", "rs-3", "rs-4"])
    );
    for name in ["rs-3", "rs-4"] {
        let process = deployment.process(name).expect("new process exists");
        assert_eq!(process.hostname, format!("{name}.mongodb.svc.cluster.local"));
        assert_eq!(
            process.extra.get("logRotate"),
            Some(&json!({"sizeThresholdMB": 1000, "timeThresholdHrs": 24}))
        );
        assert_eq!(
            process.args.get("setParameter"),
            Some(&json!({"ttlMonitorEnabled": false}))
        );
    }
}

#[test]
fn scaling_down_removes_processes_and_agents() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 5));
    deployment.add_monitoring_and_backup();
    assert_eq!(deployment.monitoring_versions.len(), 5);

    deployment.merge_replica_set(replica_set("rs", 3));

    assert_eq!(deployment.all_process_names(), names(&["rs-0", "rs-1", "rs-2"]));
    assert_eq!(
        deployment
            .replica_set("rs")
            .expect("rs exists")
            .member_names()
            .collect::<Vec<_>>(),
        vec!["rs-0", "rs-1", "rs-2"]
    );
    assert_eq!(deployment.monitoring_versions.len(), 3);
    assert_eq!(deployment.backup_versions.len(), 3);
    assert!(!deployment
        .monitoring_versions
        .iter()
        .any(|agent| agent.hostname.starts_with("rs-3")));
}

#[rstest]
#[case::small(3, 3)]
#[case::at_limit(7, 7)]
#[case::large(9, 7)]
fn at_most_seven_members_vote(#[case] members: usize, #[case] voters: usize) {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", members));
    let voting = deployment
        .replica_set("rs")
        .expect("rs exists")
        .members
        .iter()
        .filter(|member| member.is_voting())
        .count();
    assert_eq!(voting, voters);

    deployment.merge_replica_set(replica_set("rs", members));
    let voting = deployment
        .replica_set("rs")
        .expect("rs exists")
        .members
        .iter()
        .filter(|member| member.is_voting())
        .count();
    assert_eq!(voting, voters);
}

#[test]
fn standalone_merge_updates_owned_fields_only() {
    let mut deployment = Deployment::new();
    let mut existing = mongod("single");
    existing
        .extra
        .insert("alias".to_owned(), json!("primary-db"));
    deployment.merge_standalone(existing);

    deployment.merge_standalone(mongod("single").with_port(27018));

    assert_eq!(deployment.processes.len(), 1);
    let process = deployment.process("single").expect("process exists");
    assert_eq!(process.port(), Some(27018));
    assert_eq!(process.extra.get("alias"), Some(&json!("primary-db")));
}

#[test]
fn sharded_cluster_is_created() {
    let mut deployment = Deployment::new();
    let pending = deployment
        .merge_sharded_cluster(sharded_cluster(2, false))
        .expect("merge succeeds");

    assert!(!pending);
    let cluster = deployment.sharded_cluster("sh").expect("cluster exists");
    assert_eq!(cluster.config_server_replica_set, "sh-config");
    assert_eq!(cluster.shard_replica_sets().collect::<Vec<_>>(), vec!["sh-0", "sh-1"]);
    assert!(deployment
        .process("sh-config-0")
        .expect("config server exists")
        .is_config_server());
    assert!(!deployment.process("sh-0-0").expect("shard exists").is_config_server());
    assert_eq!(
        deployment.mongos_process_names("sh"),
        names(&["sh-mongos-0", "sh-mongos-1"])
    );
    assert_eq!(
        deployment.process_names(ResourceKind::ShardedCluster, "sh").len(),
        2 + 3 + 2 * 3
    );
}

#[test]
fn sharded_cluster_merge_is_idempotent() {
    let mut deployment = Deployment::new();
    deployment
        .merge_sharded_cluster(sharded_cluster(2, false))
        .expect("merge succeeds");
    let once = deployment.clone();

    let pending = deployment
        .merge_sharded_cluster(sharded_cluster(2, false))
        .expect("merge succeeds");
    assert!(!pending);
    assert_eq!(deployment, once);
}

#[test]
fn removed_shards_drain_before_deletion() {
    let mut deployment = Deployment::new();
    deployment
        .merge_sharded_cluster(sharded_cluster(3, false))
        .expect("merge succeeds");
    deployment.add_monitoring_and_backup();

    let pending = deployment
        .merge_sharded_cluster(sharded_cluster(2, false))
        .expect("merge succeeds");

    assert!(pending);
    let cluster = deployment.sharded_cluster("sh").expect("cluster exists");
    assert_eq!(cluster.draining, names(&["sh-2"]));
    assert_eq!(cluster.shard_replica_sets().collect::<Vec<_>>(), vec!["sh-0", "sh-1"]);
    assert!(deployment.replica_set("sh-2").is_some());
    assert!(deployment.process("sh-2-0").is_some());
    assert_eq!(deployment.number_of_excess_processes("sh"), 0);

    let pending = deployment
        .merge_sharded_cluster(sharded_cluster(2, true))
        .expect("merge succeeds");

    assert!(!pending);
    let cluster = deployment.sharded_cluster("sh").expect("cluster exists");
    assert!(cluster.draining.is_empty());
    assert!(deployment.replica_set("sh-2").is_none());
    assert!(deployment.process("sh-2-0").is_none());
    assert!(!deployment
        .backup_versions
        .iter()
        .any(|agent| agent.hostname.starts_with("sh-2-")));
}

#[test]
fn mongos_with_wrong_type_is_rejected() {
    let mut deployment = Deployment::new();
    let mut desired = sharded_cluster(1, false);
    desired.mongos_processes.push(mongod("sh-mongos-2"));

    let result = deployment.merge_sharded_cluster(desired);

    assert!(matches!(
        result,
        Err(Error::MongosProcessTypeMismatch {
            process_type: ProcessType::Mongod,
            ..
        })
    ));
    assert_eq!(deployment, Deployment::new());
}

#[test]
fn mongos_scale_down_removes_processes() {
    let mut deployment = Deployment::new();
    deployment
        .merge_sharded_cluster(sharded_cluster(1, false))
        .expect("merge succeeds");

    let mut desired = sharded_cluster(1, false);
    desired.mongos_processes.truncate(1);
    deployment
        .merge_sharded_cluster(desired)
        .expect("merge succeeds");

    assert_eq!(deployment.mongos_process_names("sh"), names(&["sh-mongos-0"]));
    assert!(deployment.process("sh-mongos-1").is_none());
}

#[test]
fn sharded_cluster_is_removed_with_everything_it_owns() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("other", 1));
    deployment
        .merge_sharded_cluster(sharded_cluster(2, false))
        .expect("merge succeeds");
    deployment.add_monitoring_and_backup();

    deployment
        .remove_sharded_cluster_by_name("sh")
        .expect("cluster exists");

    assert!(deployment.sharding.is_empty());
    assert_eq!(deployment.all_process_names(), names(&["other-0"]));
    assert_eq!(deployment.replica_sets.len(), 1);
    assert_eq!(deployment.monitoring_versions.len(), 1);
    assert!(matches!(
        deployment.remove_sharded_cluster_by_name("sh"),
        Err(Error::ShardedClusterNotFound { .. })
    ));
}

#[test]
fn removal_by_name() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 3));
    deployment.merge_standalone(mongod("single"));

    deployment
        .remove_process_by_name("single")
        .expect("process exists");
    deployment
        .remove_replica_set_by_name("rs")
        .expect("replica set exists");

    assert!(deployment.processes.is_empty());
    assert!(deployment.replica_sets.is_empty());
    assert!(matches!(
        deployment.remove_process_by_name("single"),
        Err(Error::ProcessNotFound { .. })
    ));
    assert!(matches!(
        deployment.remove_replica_set_by_name("rs"),
        Err(Error::ReplicaSetNotFound { .. })
    ));
}

#[test]
fn members_are_marked_unvoted() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 3));

    deployment
        .mark_rs_members_unvoted("rs", &names(&["rs-2"]))
        .expect("member exists");

    let rs = deployment.replica_set("rs").expect("rs exists");
    assert_eq!(rs.members[2].votes, 0);
    assert_eq!(rs.members[2].priority, Number::from(0));
    assert!(rs.members[1].is_voting());
    assert!(matches!(
        deployment.mark_rs_members_unvoted("rs", &names(&["rs-7"])),
        Err(Error::MemberNotFound { .. })
    ));
}

#[test]
fn processes_are_disabled() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 2));

    deployment
        .disable_processes(&names(&["rs-1"]))
        .expect("process exists");

    assert_eq!(deployment.process("rs-0").expect("exists").disabled, None);
    assert_eq!(deployment.process("rs-1").expect("exists").disabled, Some(true));
}

#[test]
fn internal_cluster_authentication_is_configured() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 2));

    deployment.configure_internal_cluster_authentication(
        &names(&["rs-0", "missing"]),
        Some(ClusterAuthMode::X509),
        Some("/mongodb-automation/cluster.pem"),
    );

    assert_eq!(
        deployment.process("rs-0").expect("exists").cluster_auth_mode(),
        Some("x509")
    );
    assert_eq!(deployment.process("rs-1").expect("exists").cluster_auth_mode(), None);
}

#[rstest]
#[case::empty(&[], 0)]
#[case::single(&["4.2.1"], 4)]
#[case::mixed(&["4.2.1", "3.6.8", "5.0.0-ent"], 3)]
fn minimum_major_version(#[case] versions: &[&str], #[case] expected: u64) {
    let mut deployment = Deployment::new();
    for (i, version) in versions.iter().enumerate() {
        deployment.merge_standalone(
            Process::new_mongod(format!("p-{i}"), format!("p-{i}.local"), *version)
                .expect("version is valid"),
        );
    }
    assert_eq!(
        deployment.minimum_major_version().expect("versions are valid"),
        expected
    );
}

#[test]
fn tls_is_enabled_only_when_every_process_has_a_certificate() {
    let mut deployment = Deployment::new();
    deployment.merge_standalone(mongod("a").with_tls(TlsMode::Require, Some("/etc/a.pem")));
    assert!(deployment.all_processes_are_tls_enabled());

    deployment.merge_standalone(mongod("b"));
    assert!(!deployment.all_processes_are_tls_enabled());
}

#[test]
fn excess_processes_are_counted() {
    let mut deployment = Deployment::new();
    deployment.merge_replica_set(replica_set("rs", 3));
    assert_eq!(deployment.number_of_excess_processes("rs"), 0);

    deployment.merge_standalone(mongod("stray"));
    deployment.merge_replica_set(replica_set("other", 2));
    assert_eq!(deployment.number_of_excess_processes("rs"), 3);
    assert_eq!(deployment.number_of_excess_processes("stray"), 5);
}

#[test]
fn monitoring_and_backup_cover_every_host_once() {
    let mut deployment = customized_deployment();
    deployment.add_monitoring_and_backup();
    deployment.add_monitoring_and_backup();

    assert_eq!(deployment.monitoring_versions.len(), 3);
    assert_eq!(deployment.backup_versions.len(), 3);
    assert_eq!(
        deployment.monitoring_versions[0].extra.get("logPath"),
        Some(&json!("/var/log/monitoring"))
    );
    assert!(deployment
        .backup_versions
        .iter()
        .all(|agent| agent.name == BACKUP_AGENT_DEFAULT_VERSION));
    assert_eq!(
        deployment.monitoring_versions[2].name,
        MONITORING_AGENT_DEFAULT_VERSION
    );
}
