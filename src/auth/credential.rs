use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::serdes::serde_dur_option;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyStatus {
	#[default]
	Active,
	Disabled,
	Expired,
}

/// What a provider returns for a presented key. The provider that produced a
/// record is authoritative for it; quota deltas are written back through
/// that same provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CredentialRecord {
	pub key: String,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub status: KeyStatus,
	/// Total quota in tokens; 0 means unmetered.
	#[serde(default)]
	pub quota: u64,
	#[serde(default)]
	pub used: u64,
	#[serde(default)]
	pub allowed_ips: Vec<String>,
	#[serde(default)]
	pub denied_ips: Vec<String>,
	#[serde(default)]
	pub expire_at: Option<DateTime<Utc>>,
	#[serde(default, with = "serde_dur_option")]
	pub reset_period: Option<Duration>,
	#[serde(default)]
	pub last_reset: Option<DateTime<Utc>>,
}

impl CredentialRecord {
	pub fn new(key: impl Into<String>) -> CredentialRecord {
		CredentialRecord {
			key: key.into(),
			user_id: String::new(),
			name: String::new(),
			status: KeyStatus::Active,
			quota: 0,
			used: 0,
			allowed_ips: Vec::new(),
			denied_ips: Vec::new(),
			expire_at: None,
			reset_period: None,
			last_reset: None,
		}
	}

	/// True when a configured reset period has elapsed since the last reset
	/// (or since forever, if a period is configured but never applied).
	pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
		let Some(period) = self.reset_period else {
			return false;
		};
		match self.last_reset {
			Some(last) => {
				now.signed_duration_since(last).to_std().unwrap_or_default() >= period
			},
			None => true,
		}
	}
}

/// Outcomes of the standard checks, also handed to decision scripts.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct StandardChecks {
	pub status_ok: bool,
	pub not_expired: bool,
	pub ip_allowed: bool,
	pub quota_ok: bool,
}

impl StandardChecks {
	pub fn passed(&self) -> bool {
		self.status_ok && self.not_expired && self.ip_allowed && self.quota_ok
	}

	/// The first failing check, mapped to a rejection reason and status.
	pub fn failure(&self) -> Option<(&'static str, u16)> {
		if !self.status_ok {
			Some(("key is not active", 403))
		} else if !self.not_expired {
			Some(("key has expired", 403))
		} else if !self.ip_allowed {
			Some(("client address not allowed", 403))
		} else if !self.quota_ok {
			Some(("quota exhausted", 429))
		} else {
			None
		}
	}
}

pub fn run_standard_checks(
	cred: &CredentialRecord,
	client_ip: IpAddr,
	now: DateTime<Utc>,
) -> StandardChecks {
	let status_ok = cred.status == KeyStatus::Active;
	let not_expired = cred.expire_at.map(|t| t > now).unwrap_or(true);
	let ip_allowed = ip_permitted(&cred.allowed_ips, &cred.denied_ips, client_ip);
	let quota_ok = cred.quota == 0 || cred.used < cred.quota;
	StandardChecks {
		status_ok,
		not_expired,
		ip_allowed,
		quota_ok,
	}
}

/// Deny wins: an address matching any deny entry is rejected even when an
/// allow entry also matches. An empty allow list permits every address.
fn ip_permitted(allowed: &[String], denied: &[String], ip: IpAddr) -> bool {
	if denied.iter().any(|cidr| cidr_contains(cidr, ip)) {
		return false;
	}
	if allowed.is_empty() {
		return true;
	}
	allowed.iter().any(|cidr| cidr_contains(cidr, ip))
}

fn cidr_contains(entry: &str, ip: IpAddr) -> bool {
	if let Ok(net) = IpNet::from_str(entry) {
		return net.contains(&ip);
	}
	// A bare address is treated as a host entry.
	IpAddr::from_str(entry).map(|a| a == ip).unwrap_or(false)
}
