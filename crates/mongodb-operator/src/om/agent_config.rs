//! Project-wide settings of the monitoring and backup agents.
//!
//! Both configurations share their shape, so they are the same [`AgentConfig`] type tagged with
//! the agent it belongs to.

use std::marker::PhantomData;

use mongodb_shared::merge::{self, DELETION_SENTINEL, merge_with};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use snafu::{ResultExt, Snafu};
use strum::Display;

use crate::om::automation_config::AGENT_PEM_KEY_FILE_PATH;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to decode the {kind} agent configuration"))]
    Decode {
        source: serde_json::Error,
        kind: AgentKind,
    },

    #[snafu(display("failed to merge the {kind} agent configuration"))]
    Merge {
        source: merge::Error,
        kind: AgentKind,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum AgentKind {
    Monitoring,
    Backup,
}

impl AgentKind {
    /// The resource below `automationConfig` holding the configuration of this agent.
    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Monitoring => "monitoringAgentConfig",
            Self::Backup => "backupAgentConfig",
        }
    }
}

pub trait Agent {
    const KIND: AgentKind;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Monitoring;

impl Agent for Monitoring {
    const KIND: AgentKind = AgentKind::Monitoring;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backup;

impl Agent for Backup {
    const KIND: AgentKind = AgentKind::Backup;
}

pub type MonitoringAgentConfig = AgentConfig<Monitoring>;
pub type BackupAgentConfig = AgentConfig<Backup>;

/// The typed part of an agent configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(rename = "sslPEMKeyFile", default, skip_serializing_if = "Option::is_none")]
    pub ssl_pem_key_file: Option<String>,

    #[serde(rename = "ldapGroupDN", default, skip_serializing_if = "Option::is_none")]
    pub ldap_group_dn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_rotate: Option<LogRotate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRotate {
    #[serde(rename = "sizeThresholdMB")]
    pub size_threshold_mb: u64,

    pub time_threshold_hrs: u64,
}

/// An agent configuration: the typed [`AgentTemplate`] and the document it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentConfig<A> {
    pub template: AgentTemplate,
    backing: Map<String, Value>,
    agent: PhantomData<A>,
}

impl<A: Agent> AgentConfig<A> {
    pub fn from_map(backing: Map<String, Value>) -> Result<Self> {
        let template = serde_json::from_value(Value::Object(backing.clone()))
            .context(DecodeSnafu { kind: A::KIND })?;
        Ok(Self {
            template,
            backing,
            agent: PhantomData,
        })
    }

    pub fn kind(&self) -> AgentKind {
        A::KIND
    }

    /// The document as of the last [`AgentConfig::apply`].
    pub fn backing(&self) -> &Map<String, Value> {
        &self.backing
    }

    pub fn into_backing(self) -> Map<String, Value> {
        self.backing
    }

    /// Merges the template into the backing document.
    pub fn apply(&mut self) -> Result<()> {
        self.backing =
            merge_with(&self.template, &self.backing).context(MergeSnafu { kind: A::KIND })?;
        Ok(())
    }

    /// Makes the agent authenticate as `subject` with the shared agent certificate.
    pub fn enable_x509_authentication(&mut self, subject: &str) {
        self.template.username = Some(subject.to_owned());
        self.template.ssl_pem_key_file = Some(AGENT_PEM_KEY_FILE_PATH.to_owned());
    }

    pub fn disable_x509_authentication(&mut self) {
        self.template.username = Some(DELETION_SENTINEL.to_owned());
        self.template.ssl_pem_key_file = Some(DELETION_SENTINEL.to_owned());
    }

    pub fn is_x509_authentication_enabled(&self) -> bool {
        self.template
            .ssl_pem_key_file
            .as_deref()
            .is_some_and(|path| path != DELETION_SENTINEL)
    }

    pub fn set_log_rotate(&mut self, log_rotate: LogRotate) {
        self.template.log_rotate = Some(log_rotate);
    }
}
