use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use snafu::{ResultExt, Snafu, ensure};

use crate::om::process::{self, Process, parse_version};

/// MongoDB refuses replica set configurations with more voting members than this.
pub const MAX_VOTING_MEMBERS: usize = 7;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to determine the protocol version of replica set {name:?}"))]
    ProtocolVersion { source: process::Error, name: String },

    #[snafu(display(
        "process {process:?} is a {process_type} and can't be a member of replica set {name:?}"
    ))]
    MemberNotMongod {
        process: String,
        process_type: process::ProcessType,
        name: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(
        rename = "protocolVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub protocol_version: Option<String>,

    #[serde(default)]
    pub members: Vec<ReplicaSetMember>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetMember {
    #[serde(rename = "_id")]
    pub id: i64,

    /// Name of the process backing this member (not its hostname).
    pub host: String,

    #[serde(default = "ReplicaSetMember::default_votes")]
    pub votes: i64,

    #[serde(default = "ReplicaSetMember::default_priority")]
    /// Kept as written, `1` stays an integer and `0.5` a float.
    pub priority: Number,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizons: Option<Map<String, Value>>,

    /// Externally owned member settings such as `arbiterOnly`, `hidden` or `slaveDelay`.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplicaSetMember {
    fn default_votes() -> i64 {
        1
    }

    fn default_priority() -> Number {
        Number::from(1)
    }

    pub fn is_voting(&self) -> bool {
        self.votes > 0
    }

    pub fn demote(&mut self) {
        self.votes = 0;
        self.priority = Number::from(0);
    }
}

impl ReplicaSet {
    pub fn new(name: impl Into<String>, version: &str) -> Result<Self> {
        let name = name.into();
        let version = parse_version(version).context(ProtocolVersionSnafu { name: &name })?;
        // protocolVersion only exists since MongoDB 3.2
        let protocol_version = if version >= semver::Version::new(3, 2, 0) {
            "1"
        } else {
            "0"
        };

        Ok(Self {
            id: name,
            protocol_version: Some(protocol_version.to_owned()),
            members: Vec::new(),
            extra: Map::new(),
        })
    }

    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|member| member.host.as_str())
    }

    pub fn member_mut(&mut self, name: &str) -> Option<&mut ReplicaSetMember> {
        self.members.iter_mut().find(|member| member.host == name)
    }

    /// Appends a voting member with the next free `_id`.
    pub fn add_member(&mut self, process_name: &str) {
        let id = self.members.last().map_or(0, |member| member.id + 1);
        self.members.push(ReplicaSetMember {
            id,
            host: process_name.to_owned(),
            votes: 1,
            priority: Number::from(1),
            tags: None,
            horizons: None,
            extra: Map::new(),
        });
    }

    /// Merges the operator-owned parts of `desired` into this replica set.
    ///
    /// Members are matched by host. Member settings not owned by the operator survive, the
    /// members end up ordered by `_id`. Returns the names of the members that are gone.
    pub fn merge_from(&mut self, desired: &Self) -> Vec<String> {
        self.id.clone_from(&desired.id);
        self.protocol_version.clone_from(&desired.protocol_version);

        let mut existing: IndexMap<String, ReplicaSetMember> = std::mem::take(&mut self.members)
            .into_iter()
            .map(|member| (member.host.clone(), member))
            .collect();

        let mut merged: Vec<_> = desired
            .members
            .iter()
            .map(|desired_member| match existing.shift_remove(&desired_member.host) {
                Some(mut member) => {
                    member.id = desired_member.id;
                    member.votes = desired_member.votes;
                    member.priority = desired_member.priority.clone();
                    member.tags.clone_from(&desired_member.tags);
                    member.horizons.clone_from(&desired_member.horizons);
                    member
                }
                None => desired_member.clone(),
            })
            .collect();
        merged.sort_by_key(|member| member.id);
        self.members = merged;

        existing.into_keys().collect()
    }

    /// Demotes every voting member beyond [`MAX_VOTING_MEMBERS`], in list order.
    pub fn limit_voting_members(&mut self) {
        let mut voters = 0;
        for member in &mut self.members {
            if !member.is_voting() {
                continue;
            }
            voters += 1;
            if voters > MAX_VOTING_MEMBERS {
                tracing::debug!(
                    replica_set = %self.id,
                    member = %member.host,
                    "demoting member to non-voting"
                );
                member.demote();
            }
        }
    }
}

/// A replica set descriptor together with the processes backing it, in member order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplicaSetWithProcesses {
    pub replica_set: ReplicaSet,
    pub processes: Vec<Process>,
}

impl ReplicaSetWithProcesses {
    /// Builds the descriptor for `processes`, assigning them to the replica set `name`.
    pub fn new(name: &str, mut processes: Vec<Process>, version: &str) -> Result<Self> {
        let mut replica_set = ReplicaSet::new(name, version)?;
        for process in &mut processes {
            ensure!(
                process.process_type == process::ProcessType::Mongod,
                MemberNotMongodSnafu {
                    process: &process.name,
                    process_type: process.process_type,
                    name,
                }
            );
            process.set_replica_set_name(name);
            replica_set.add_member(&process.name);
        }

        Ok(Self {
            replica_set,
            processes,
        })
    }

    pub fn name(&self) -> &str {
        &self.replica_set.id
    }

    pub fn process_names(&self) -> impl Iterator<Item = &str> {
        self.processes.iter().map(|process| process.name.as_str())
    }

    pub fn set_config_server_role(&mut self) {
        for process in &mut self.processes {
            process.set_config_server_role();
        }
    }
}
