//! Canonical delegation messages
//!
//! A delegation message is the text a long-term key signs to vouch for a set
//! of capability grants held by a session URI. Verifying nodes rebuild the
//! message from its fields and compare bytes, so rendering here is strict:
//! fixed line layout, `\n` separators, no trailing newline, millisecond UTC
//! timestamps and a compact JSON capability object.
//!
//! ```text
//! {domain} wants you to sign in with your account:
//! {address}
//!
//! {statement} I further authorize the stated URI to perform the following actions on my behalf: (1) 'Threshold': 'Execution' for 'action://*'.
//!
//! URI: {origin}
//! Version: 1
//! Chain ID: {chain_id}
//! Nonce: {nonce}
//! Issued At: {issued_at}
//! Expiration Time: {expires_at}
//! Resources:
//! - urn:recap:{base64url(capability object)}
//! ```
//!
//! Grants that share a resource URI are grouped under its first appearance;
//! otherwise caller order is preserved.

use crate::capability::{AbilityKind, CapabilityGrant, CapabilitySet, ResourceId, ScopeKind};
use crate::errors::{Result, TesseraError};
use crate::identifiers::{Address, Nonce};
use crate::time::Timestamp;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

/// Message format version
pub const MESSAGE_VERSION: &str = "1";

/// Statement prefix used when the caller does not supply one
pub const DEFAULT_STATEMENT: &str = "Authorize a session to request threshold execution.";

/// Upper bound on the issued-to-expiry window
pub const MAX_DELEGATION_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const HEADER_SUFFIX: &str = " wants you to sign in with your account:";
const RECAP_URN: &str = "urn:recap:";
const RECAP_STATEMENT: &str =
    "I further authorize the stated URI to perform the following actions on my behalf:";

/// An immutable, time-bounded authorization for a set of grants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationMessage {
    domain: String,
    address: Address,
    statement: String,
    origin: String,
    chain_id: u64,
    nonce: Nonce,
    issued_at: Timestamp,
    expires_at: Timestamp,
    grants: CapabilitySet,
}

impl DelegationMessage {
    /// Requesting domain
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Address of the long-term signer
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Human statement prefix (without the capability sentence)
    pub fn statement(&self) -> &str {
        &self.statement
    }

    /// URI the grants are delegated to
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Chain identifier
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Node-supplied freshness token
    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Issuance time
    pub fn issued_at(&self) -> Timestamp {
        self.issued_at
    }

    /// Expiry time
    pub fn expires_at(&self) -> Timestamp {
        self.expires_at
    }

    /// Grants, grouped by resource
    pub fn grants(&self) -> &CapabilitySet {
        &self.grants
    }

    /// Canonical text form. Byte-exact and deterministic.
    pub fn render(&self) -> String {
        let grants = self.grants.grants();
        let recap = recap_statement(grants);
        let statement = if self.statement.is_empty() {
            recap
        } else {
            format!("{} {recap}", self.statement)
        };

        [
            format!("{}{HEADER_SUFFIX}", self.domain),
            self.address.to_string(),
            String::new(),
            statement,
            String::new(),
            format!("URI: {}", self.origin),
            format!("Version: {MESSAGE_VERSION}"),
            format!("Chain ID: {}", self.chain_id),
            format!("Nonce: {}", self.nonce),
            format!("Issued At: {}", self.issued_at),
            format!("Expiration Time: {}", self.expires_at),
            "Resources:".to_string(),
            format!("- {RECAP_URN}{}", encode_recap(grants)),
        ]
        .join("\n")
    }

    /// Reconstruct a message from canonical text, the way a verifying node
    /// does. Text that does not re-render to the identical bytes is rejected.
    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.split('\n');
        let mut next = |label: &str| {
            lines
                .next()
                .ok_or_else(|| malformed(format!("missing {label} line")))
        };

        let domain = next("header")?
            .strip_suffix(HEADER_SUFFIX)
            .ok_or_else(|| malformed("bad header line"))?
            .to_string();
        let address: Address = next("address")?.parse()?;
        expect_blank(next("separator")?)?;
        let statement_line = next("statement")?.to_string();
        expect_blank(next("separator")?)?;
        let origin = field(next("URI")?, "URI: ")?.to_string();
        if field(next("version")?, "Version: ")? != MESSAGE_VERSION {
            return Err(malformed("unsupported version"));
        }
        let chain_id = field(next("chain id")?, "Chain ID: ")?
            .parse::<u64>()
            .map_err(|e| malformed(format!("bad chain id: {e}")))?;
        let nonce = Nonce::new(field(next("nonce")?, "Nonce: ")?)?;
        let issued_at: Timestamp = field(next("issued at")?, "Issued At: ")?.parse()?;
        let expires_at: Timestamp = field(next("expiration")?, "Expiration Time: ")?.parse()?;
        if next("resources header")? != "Resources:" {
            return Err(malformed("missing resources header"));
        }
        let encoded = field(next("resource")?, "- ")?
            .strip_prefix(RECAP_URN)
            .ok_or_else(|| malformed("resource is not a capability object"))?
            .to_string();
        if lines.next().is_some() {
            return Err(malformed("trailing content after resources"));
        }

        let grants = CapabilitySet::new(decode_recap(&encoded)?)?;
        let recap = recap_statement(grants.grants());
        let statement = match statement_line.strip_suffix(recap.as_str()) {
            Some("") => String::new(),
            Some(prefix) => prefix
                .strip_suffix(' ')
                .ok_or_else(|| malformed("statement does not match capabilities"))?
                .to_string(),
            None => return Err(malformed("statement does not match capabilities")),
        };

        let message = Self {
            domain,
            address,
            statement,
            origin,
            chain_id,
            nonce,
            issued_at,
            expires_at,
            grants,
        };
        message.validate()?;
        if message.render() != text {
            return Err(malformed("text is not in canonical form"));
        }
        Ok(message)
    }

    fn validate(&self) -> Result<()> {
        if self.grants.is_empty() {
            return Err(TesseraError::invalid_delegation(
                "delegation must carry at least one grant",
            ));
        }
        if self.issued_at >= self.expires_at {
            return Err(TesseraError::invalid_delegation(format!(
                "issued at {} is not before expiry {}",
                self.issued_at, self.expires_at
            )));
        }
        for (label, value) in [("domain", &self.domain), ("origin", &self.origin)] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(TesseraError::invalid_delegation(format!(
                    "{label} must be non-empty and contain no whitespace"
                )));
            }
        }
        if self.statement.contains(['\n', '\r']) {
            return Err(TesseraError::invalid_delegation(
                "statement must be a single line",
            ));
        }
        Ok(())
    }
}

/// Builder for [`DelegationMessage`]
#[derive(Debug, Clone)]
pub struct DelegationBuilder {
    address: Address,
    domain: String,
    statement: String,
    chain_id: u64,
    origin: Option<String>,
    nonce: Option<Nonce>,
    issued_at: Option<Timestamp>,
    expires_at: Option<Timestamp>,
    grants: Vec<CapabilityGrant>,
    max_window: Duration,
}

impl DelegationBuilder {
    /// Start a message for `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            domain: "localhost".to_string(),
            statement: DEFAULT_STATEMENT.to_string(),
            chain_id: 1,
            origin: None,
            nonce: None,
            issued_at: None,
            expires_at: None,
            grants: Vec::new(),
            max_window: MAX_DELEGATION_WINDOW,
        }
    }

    /// Set the requesting domain
    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the human statement prefix
    pub fn statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = statement.into();
        self
    }

    /// Set the chain identifier
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = chain_id;
        self
    }

    /// Set the URI the grants are delegated to
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Set the node-supplied freshness token
    pub fn nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }

    /// Set the issuance time
    pub fn issued_at(mut self, issued_at: Timestamp) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    /// Set the expiry time
    pub fn expires_at(mut self, expires_at: Timestamp) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Set the grants
    pub fn grants(mut self, grants: &CapabilitySet) -> Self {
        self.grants = grants.grants().to_vec();
        self
    }

    /// Cap the issued-to-expiry window
    pub fn max_window(mut self, max_window: Duration) -> Self {
        self.max_window = max_window;
        self
    }

    /// Validate and freeze the message.
    ///
    /// An empty grant set is a caller bug and is reported as
    /// [`TesseraError::InvalidDelegation`] rather than producing a message
    /// that authorizes nothing.
    pub fn build(self) -> Result<DelegationMessage> {
        let origin = self
            .origin
            .ok_or_else(|| TesseraError::invalid_delegation("origin is required"))?;
        let nonce = self
            .nonce
            .ok_or_else(|| TesseraError::invalid_delegation("freshness nonce is required"))?;
        let issued_at = self
            .issued_at
            .ok_or_else(|| TesseraError::invalid_delegation("issuance time is required"))?;
        let expires_at = self
            .expires_at
            .ok_or_else(|| TesseraError::invalid_delegation("expiry is required"))?;

        let window = issued_at.duration_until(&expires_at);
        if window > self.max_window {
            return Err(TesseraError::invalid_delegation(format!(
                "expiry window of {}s exceeds maximum of {}s",
                window.as_secs(),
                self.max_window.as_secs()
            )));
        }

        let message = DelegationMessage {
            domain: self.domain,
            address: self.address,
            statement: self.statement,
            origin,
            chain_id: self.chain_id,
            nonce,
            issued_at,
            expires_at,
            grants: CapabilitySet::new(group_by_resource(&self.grants))?,
        };
        message.validate()?;
        Ok(message)
    }
}

fn malformed(message: impl Into<String>) -> TesseraError {
    TesseraError::invalid_delegation(format!("malformed message: {}", message.into()))
}

fn expect_blank(line: &str) -> Result<()> {
    if line.is_empty() {
        Ok(())
    } else {
        Err(malformed("expected blank line"))
    }
}

fn field<'a>(line: &'a str, prefix: &str) -> Result<&'a str> {
    line.strip_prefix(prefix)
        .ok_or_else(|| malformed(format!("expected {:?}", prefix.trim_end())))
}

fn group_by_resource(grants: &[CapabilityGrant]) -> Vec<CapabilityGrant> {
    let mut uris: Vec<String> = Vec::new();
    let mut buckets: Vec<Vec<CapabilityGrant>> = Vec::new();
    for grant in grants {
        let uri = grant.resource_uri();
        match uris.iter().position(|u| *u == uri) {
            Some(i) => buckets[i].push(*grant),
            None => {
                uris.push(uri);
                buckets.push(vec![*grant]);
            }
        }
    }
    buckets.into_iter().flatten().collect()
}

fn recap_statement(grants: &[CapabilityGrant]) -> String {
    let mut statement = RECAP_STATEMENT.to_string();
    for (i, grant) in grants.iter().enumerate() {
        let ability = grant.ability.recap_ability();
        let (namespace, name) = ability.split_once('/').unwrap_or((ability, ""));
        statement.push_str(&format!(
            " ({}) '{namespace}': '{name}' for '{}'.",
            i + 1,
            grant.resource_uri()
        ));
    }
    statement
}

fn encode_recap(grants: &[CapabilityGrant]) -> String {
    let mut att = Map::new();
    for grant in grants {
        let entry = att
            .entry(grant.resource_uri())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(abilities) = entry {
            let mut caveat = Map::new();
            if let Some(scope) = grant.scope.caveat() {
                caveat.insert("scope".to_string(), Value::String(scope.to_string()));
            }
            abilities.insert(
                grant.ability.recap_ability().to_string(),
                Value::Array(vec![Value::Object(caveat)]),
            );
        }
    }
    let mut object = Map::new();
    object.insert("att".to_string(), Value::Object(att));
    object.insert("prf".to_string(), Value::Array(Vec::new()));
    URL_SAFE_NO_PAD.encode(Value::Object(object).to_string())
}

fn decode_recap(encoded: &str) -> Result<Vec<CapabilityGrant>> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| malformed(format!("capability object is not base64url: {e}")))?;
    let object: Value = serde_json::from_slice(&bytes)
        .map_err(|e| malformed(format!("capability object is not JSON: {e}")))?;
    let att = object
        .get("att")
        .and_then(Value::as_object)
        .ok_or_else(|| malformed("capability object lacks att"))?;

    let mut grants = Vec::new();
    for (uri, abilities) in att {
        let (prefix, resource) = uri
            .split_once("://")
            .ok_or_else(|| malformed(format!("bad resource uri {uri:?}")))?;
        let resource: ResourceId = resource.parse()?;
        let abilities = abilities
            .as_object()
            .ok_or_else(|| malformed(format!("abilities for {uri:?} are not an object")))?;
        for (ability, caveats) in abilities {
            let ability = AbilityKind::from_recap(prefix, ability)
                .ok_or_else(|| malformed(format!("unknown ability {ability:?} for {uri:?}")))?;
            let caveat = caveats
                .as_array()
                .and_then(|c| c.first())
                .ok_or_else(|| malformed(format!("missing caveats for {uri:?}")))?;
            let scope = match caveat.get("scope") {
                None => None,
                Some(value) => Some(
                    value
                        .as_str()
                        .ok_or_else(|| malformed("scope caveat is not a string"))?,
                ),
            };
            let scope = ScopeKind::from_caveat(scope)
                .ok_or_else(|| malformed(format!("unknown scope {scope:?}")))?;
            grants.push(CapabilityGrant {
                resource,
                ability,
                scope,
            });
        }
    }
    Ok(grants)
}
