//! Findings handed over by the upstream validators.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Suffix appended to the chain of a pending (not yet promoted) deployment version.
pub const PENDING_SUFFIX: &str = "-PENDING";

/// Validator output for one deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentFindings {
    /// Deployment name, e.g. `uniswap-v3-ethereum`.
    pub deployment: String,
    /// Protocol the deployment belongs to; one thread per protocol.
    pub protocol: String,
    #[serde(default)]
    pub protocol_type: String,
    /// Chain the deployment indexes.
    pub network: String,
    #[serde(default)]
    pub url: String,
    /// Deployment is a pending version that has not replaced the current one yet.
    #[serde(default)]
    pub pending: bool,
    /// Production-tier deployments are mirrored into the aggregate thread.
    #[serde(default)]
    pub prod: bool,
    /// Block the indexer failed at, if indexing failed.
    #[serde(default)]
    pub indexing_error: Option<u64>,
    #[serde(default)]
    pub indexing_error_message: Option<String>,
    #[serde(default)]
    pub protocol_errors: IndexMap<String, Vec<String>>,
    #[serde(default)]
    pub pool_errors: IndexMap<String, Vec<String>>,
}

impl DeploymentFindings {
    /// Chain label used in rendered rows; pending versions get [`PENDING_SUFFIX`].
    pub fn chain_label(&self) -> String {
        if self.pending {
            format!("{}{PENDING_SUFFIX}", self.network)
        } else {
            self.network.clone()
        }
    }

    pub fn is_governance(&self) -> bool {
        self.protocol_type.eq_ignore_ascii_case("governance")
    }

    /// Flatten the level errors into individual findings, in validator order.
    pub fn findings(&self) -> Vec<Finding> {
        let chain = self.chain_label();
        let level = |level: IssueLevel, errors: &IndexMap<String, Vec<String>>| {
            errors
                .iter()
                .flat_map(|(issue_type, values)| {
                    values.iter().map(|value| Finding {
                        subject_key: chain.clone(),
                        level,
                        issue_type: issue_type.clone(),
                        value: value.clone(),
                    })
                })
                .collect::<Vec<_>>()
        };

        let mut findings = level(IssueLevel::Protocol, &self.protocol_errors);
        findings.extend(level(IssueLevel::Pool, &self.pool_errors));
        findings
    }
}

/// Which validator produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IssueLevel {
    Protocol,
    Pool,
}

impl IssueLevel {
    /// Embed title prefix for this level.
    pub const fn title(self) -> &'static str {
        match self {
            Self::Protocol => "PROTOCOL LEVEL ERRORS",
            Self::Pool => "POOL LEVEL ERRORS",
        }
    }
}

/// A single anomaly detected for one deployment/chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Finding {
    /// Chain label the finding was detected on.
    pub subject_key: String,
    pub level: IssueLevel,
    pub issue_type: String,
    pub value: String,
}
