//! A single `mongod` or `mongos` process of a deployment.
//!
//! The process configuration (`args2_6`) is split into fields this crate owns and overwrites on
//! every merge (see [`Process::merge_from`]), and everything else, which belongs to whoever put
//! it there (the UI, agents, a human) and is never touched.

use mongodb_shared::document::{get_path, get_str, remove_path, set_path};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use strum::{AsRefStr, Display, EnumString};

pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_DB_PATH: &str = "/data";
pub const DEFAULT_LOG_PATH: &str = "/var/log/mongodb-mms-automation/mongodb.log";

const PORT: &[&str] = &["net", "port"];
const TLS: &[&str] = &["net", "ssl"];
const TLS_MODE: &[&str] = &["net", "ssl", "mode"];
const TLS_PEM_KEY_FILE: &[&str] = &["net", "ssl", "PEMKeyFile"];
const TLS_CLUSTER_FILE: &[&str] = &["net", "ssl", "clusterFile"];
const DB_PATH: &[&str] = &["storage", "dbPath"];
const CACHE_SIZE_GB: &[&str] = &["storage", "wiredTiger", "engineConfig", "cacheSizeGB"];
const LOG_DESTINATION: &[&str] = &["systemLog", "destination"];
const LOG_PATH: &[&str] = &["systemLog", "path"];
const REPLICA_SET_NAME: &[&str] = &["replication", "replSetName"];
const CLUSTER_ROLE: &[&str] = &["sharding", "clusterRole"];
const CLUSTER_AUTH_MODE: &[&str] = &["security", "clusterAuthMode"];

const CONFIG_SERVER_ROLE: &str = "configsvr";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse MongoDB version {version:?}"))]
    ParseVersion {
        source: semver::Error,
        version: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessType {
    Mongod,
    Mongos,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr, EnumString)]
pub enum TlsMode {
    #[strum(serialize = "disabled")]
    Disabled,

    #[strum(serialize = "allowSSL")]
    Allow,

    #[strum(serialize = "preferSSL")]
    Prefer,

    #[strum(serialize = "requireSSL")]
    Require,
}

/// Value of `security.clusterAuthMode`, how members authenticate to each other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum ClusterAuthMode {
    KeyFile,
    SendKeyFile,
    SendX509,
    X509,
}

impl ClusterAuthMode {
    /// X.509 based modes need a certificate for the member (the `clusterFile`).
    pub fn uses_certificates(self) -> bool {
        matches!(self, Self::SendX509 | Self::X509)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub name: String,
    pub hostname: String,
    pub version: String,
    pub process_type: ProcessType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_compatibility_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_schema_version: Option<i64>,

    /// Name of the sharded cluster a mongos belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,

    #[serde(default, rename = "args2_6")]
    pub args: Map<String, Value>,

    /// Everything this crate doesn't manage (`logRotate`, `alias`, `kerberos`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Process {
    /// Creates a process with all the defaults the automation agents require.
    pub fn new(
        process_type: ProcessType,
        name: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        let mut process = Self {
            name: name.into(),
            hostname: hostname.into(),
            version: version.into(),
            process_type,
            feature_compatibility_version: None,
            auth_schema_version: None,
            cluster: None,
            disabled: None,
            args: Map::new(),
            extra: Map::new(),
        };
        process.init_defaults()?;
        process.set_port(DEFAULT_PORT);
        process.set_log_path(DEFAULT_LOG_PATH);
        if process_type == ProcessType::Mongod {
            process.set_db_path(DEFAULT_DB_PATH);
        }

        Ok(process)
    }

    pub fn new_mongod(
        name: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
    ) -> Result<Self> {
        Self::new(ProcessType::Mongod, name, hostname, version)
    }

    pub fn new_mongos(
        name: impl Into<String>,
        hostname: impl Into<String>,
        version: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Result<Self> {
        let mut process = Self::new(ProcessType::Mongos, name, hostname, version)?;
        process.cluster = Some(cluster.into());
        Ok(process)
    }

    /// Derives the auth schema version and feature compatibility version from the version.
    fn init_defaults(&mut self) -> Result<()> {
        let version = parse_version(&self.version)?;
        self.auth_schema_version = Some(if version.major >= 3 { 5 } else { 3 });
        self.feature_compatibility_version = (version >= semver::Version::new(3, 4, 0))
            .then(|| format!("{}.{}", version.major, version.minor));
        Ok(())
    }

    pub fn with_replica_set_name(mut self, name: &str) -> Self {
        self.set_replica_set_name(name);
        self
    }

    pub fn with_tls(mut self, mode: TlsMode, pem_key_file: Option<&str>) -> Self {
        self.set_tls(mode, pem_key_file);
        self
    }

    pub fn with_cache_size_gb(mut self, cache_size_gb: f64) -> Self {
        set_path(&mut self.args, CACHE_SIZE_GB, cache_size_gb);
        self
    }

    pub fn with_db_path(mut self, db_path: &str) -> Self {
        self.set_db_path(db_path);
        self
    }

    pub fn with_log_path(mut self, log_path: &str) -> Self {
        self.set_log_path(log_path);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.set_port(port);
        self
    }

    pub fn port(&self) -> Option<u64> {
        get_path(&self.args, PORT).and_then(Value::as_u64)
    }

    pub fn set_port(&mut self, port: u16) {
        set_path(&mut self.args, PORT, port);
    }

    pub fn db_path(&self) -> Option<&str> {
        get_str(&self.args, DB_PATH)
    }

    pub fn set_db_path(&mut self, db_path: &str) {
        set_path(&mut self.args, DB_PATH, db_path);
    }

    pub fn log_path(&self) -> Option<&str> {
        get_str(&self.args, LOG_PATH)
    }

    pub fn set_log_path(&mut self, log_path: &str) {
        set_path(&mut self.args, LOG_DESTINATION, "file");
        set_path(&mut self.args, LOG_PATH, log_path);
    }

    pub fn cache_size_gb(&self) -> Option<f64> {
        get_path(&self.args, CACHE_SIZE_GB).and_then(Value::as_f64)
    }

    pub fn replica_set_name(&self) -> Option<&str> {
        get_str(&self.args, REPLICA_SET_NAME)
    }

    pub fn set_replica_set_name(&mut self, name: &str) {
        set_path(&mut self.args, REPLICA_SET_NAME, name);
    }

    pub fn is_config_server(&self) -> bool {
        get_str(&self.args, CLUSTER_ROLE) == Some(CONFIG_SERVER_ROLE)
    }

    pub fn set_config_server_role(&mut self) {
        set_path(&mut self.args, CLUSTER_ROLE, CONFIG_SERVER_ROLE);
    }

    pub fn tls_mode(&self) -> Option<&str> {
        get_str(&self.args, TLS_MODE)
    }

    pub fn set_tls(&mut self, mode: TlsMode, pem_key_file: Option<&str>) {
        set_path(&mut self.args, TLS_MODE, mode.as_ref());
        match pem_key_file {
            Some(pem_key_file) if mode != TlsMode::Disabled => {
                set_path(&mut self.args, TLS_PEM_KEY_FILE, pem_key_file);
            }
            _ => {
                remove_path(&mut self.args, TLS_PEM_KEY_FILE);
            }
        }
    }

    /// A process counts as TLS enabled once it has a certificate to serve.
    pub fn is_tls_enabled(&self) -> bool {
        get_path(&self.args, TLS_PEM_KEY_FILE).is_some()
    }

    pub fn cluster_auth_mode(&self) -> Option<&str> {
        get_str(&self.args, CLUSTER_AUTH_MODE)
    }

    /// Configures internal cluster authentication. Passing [`None`] removes it again.
    pub fn configure_cluster_auth_mode(
        &mut self,
        mode: Option<ClusterAuthMode>,
        cluster_file: Option<&str>,
    ) {
        match mode {
            Some(mode) => {
                set_path(&mut self.args, CLUSTER_AUTH_MODE, mode.as_ref());
                match cluster_file {
                    Some(cluster_file) if mode.uses_certificates() => {
                        set_path(&mut self.args, TLS_CLUSTER_FILE, cluster_file);
                    }
                    _ => {
                        remove_path(&mut self.args, TLS_CLUSTER_FILE);
                    }
                }
            }
            None => {
                remove_path(&mut self.args, CLUSTER_AUTH_MODE);
                remove_path(&mut self.args, TLS_CLUSTER_FILE);
            }
        }
    }

    /// Major version, taken from the feature compatibility version if there is one.
    pub fn major_version(&self) -> Result<u64> {
        let version = self
            .feature_compatibility_version
            .as_deref()
            .unwrap_or(&self.version);
        parse_version(version).map(|version| version.major)
    }

    /// Copies all operator-owned fields of `desired` into this process.
    ///
    /// Fields not listed here are externally owned and stay as they are.
    pub fn merge_from(&mut self, desired: &Self) {
        self.name.clone_from(&desired.name);
        self.hostname.clone_from(&desired.hostname);
        self.version.clone_from(&desired.version);
        self.process_type = desired.process_type;
        self.auth_schema_version = desired.auth_schema_version;
        self.feature_compatibility_version
            .clone_from(&desired.feature_compatibility_version);

        if let Some(port) = get_path(&desired.args, PORT) {
            set_path(&mut self.args, PORT, port.clone());
        }
        if let Some(log_path) = desired.log_path() {
            self.set_log_path(log_path);
        }

        match desired.process_type {
            ProcessType::Mongod => {
                if let Some(db_path) = desired.db_path() {
                    self.set_db_path(db_path);
                }
                if let Some(name) = desired.replica_set_name().filter(|name| !name.is_empty()) {
                    self.set_replica_set_name(name);
                }
                if desired.is_config_server() {
                    self.set_config_server_role();
                }
                if let Some(cache_size) = get_path(&desired.args, CACHE_SIZE_GB) {
                    set_path(&mut self.args, CACHE_SIZE_GB, cache_size.clone());
                }
            }
            ProcessType::Mongos => {
                self.cluster.clone_from(&desired.cluster);
            }
        }

        self.merge_tls_from(desired);

        if let Some(mode) = desired.cluster_auth_mode() {
            set_path(&mut self.args, CLUSTER_AUTH_MODE, mode);
            if let Some(cluster_file) = get_path(&desired.args, TLS_CLUSTER_FILE) {
                set_path(&mut self.args, TLS_CLUSTER_FILE, cluster_file.clone());
            }
        }
    }

    fn merge_tls_from(&mut self, desired: &Self) {
        let Some(Value::Object(desired_tls)) = get_path(&desired.args, TLS) else {
            remove_path(&mut self.args, TLS);
            return;
        };
        if desired.tls_mode().is_none() {
            remove_path(&mut self.args, TLS);
            return;
        }

        for (key, value) in desired_tls {
            let mut path = TLS.to_vec();
            path.push(key.as_str());
            set_path(&mut self.args, &path, value.clone());
        }
        if desired.tls_mode() == Some(TlsMode::Disabled.as_ref()) {
            remove_path(&mut self.args, TLS_PEM_KEY_FILE);
        }
    }

    /// Creates a copy carrying the new name, used when a replica set or the mongos fleet grows.
    pub(crate) fn clone_as(&self, name: &str) -> Self {
        let mut process = self.clone();
        process.name = name.to_owned();
        process.extra.shift_remove("alias");
        process
    }
}

/// Parses MongoDB versions such as `4.2.1-ent` or feature compatibility versions such as `4.2`.
pub fn parse_version(version: &str) -> Result<semver::Version> {
    let core = version
        .split_once('-')
        .map_or(version, |(core, _)| core)
        .trim();
    let padded = match core.matches('.').count() {
        0 => format!("{core}.0.0"),
        1 => format!("{core}.0"),
        _ => core.to_owned(),
    };
    semver::Version::parse(&padded).context(ParseVersionSnafu { version })
}
