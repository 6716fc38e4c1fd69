//! The state model a sidecar publishes for its upstream client and the
//! proxy consumes for routing decisions.

use core::fmt::{Display, Formatter, Result as FmtResult};

use anyhow::{anyhow, Result as AnyResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display as StrumDisplay, EnumString};
use web3::types::{H256, U256, U64};

/// Stable identifier for an upstream Ethereum node.
pub type ClientId = String;

/// How the sidecar reaches its upstream node. Variant order doubles as
/// routing preference: earlier variants are preferred.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    StrumDisplay,
)]
pub enum ConnectionType {
    Direct,
    Managed,
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Direct
    }
}

/// Parsed form of a `web3_clientVersion` string such as
/// `Geth/v1.10.8-stable/linux-amd64/go1.16`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientVersion {
    pub name:     String,
    pub version:  String,
    pub os:       String,
    pub language: String,
}

impl ClientVersion {
    pub fn parse(value: &str) -> AnyResult<Self> {
        let segments: Vec<&str> = value.split('/').collect();
        match segments.as_slice() {
            [name, version, os, language] => Ok(Self {
                name:     (*name).to_owned(),
                version:  (*version).to_owned(),
                os:       (*os).to_owned(),
                language: (*language).to_owned(),
            }),
            _ => Err(anyhow!(
                "expected 4 segments in client version, found {}: {}",
                segments.len(),
                value
            )),
        }
    }
}

impl Display for ClientVersion {
    fn fmt(&self, fmt: &mut Formatter) -> FmtResult {
        write!(
            fmt,
            "{}/{}/{}/{}",
            self.name, self.version, self.os, self.language
        )
    }
}

/// Subset of `admin_nodeInfo` the proxy cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id:             String,
    pub name:           String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enode:          Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports:          Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocols:      Option<Value>,
    #[serde(default, rename = "listenAddr", skip_serializing_if = "Option::is_none")]
    pub listen_address: Option<String>,
}

/// Written once per session by the sidecar.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProfile {
    pub id:              ClientId,
    #[serde(default)]
    pub connection_type: ConnectionType,
    pub network_id:      u64,
    pub chain_id:        u64,
    pub client_version:  ClientVersion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_info:       Option<NodeInfo>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub syncing: bool,
}

/// The most recent head announced by a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub block_number:     U64,
    pub block_hash:       H256,
    pub parent_hash:      H256,
    pub difficulty:       U256,
    pub total_difficulty: U256,
}

/// Updated on every new head notification; deletion signals session end.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStatus {
    pub id:          ClientId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head:        Option<Head>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,
}

impl ClientStatus {
    /// Overlay `update` on `self`: head and sync status are replaced
    /// independently when present in the update.
    #[must_use]
    pub fn merge(&self, update: &Self) -> Self {
        Self {
            id:          self.id.clone(),
            head:        update.head.or(self.head),
            sync_status: update.sync_status.or(self.sync_status),
        }
    }
}
