//! Capability model: `(resource, ability, scope)` grants
//!
//! Grants are the unit a delegation message vouches for. A grant naming a
//! [`ContentId`] authorizes exactly that payload; a wildcard grant authorizes
//! any payload and is meant for development flows only.

use crate::content::{ContentAddressing, ContentId};
use crate::errors::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const WILDCARD: &str = "*";

/// What a grant applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceId {
    /// Any resource in the ability's namespace
    Wildcard,
    /// Exactly one content-addressed payload
    Content(ContentId),
}

impl ResourceId {
    /// Whether this resource covers `content_id`
    pub fn matches(&self, content_id: &ContentId) -> bool {
        match self {
            ResourceId::Wildcard => true,
            ResourceId::Content(id) => id == content_id,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Wildcard => f.write_str(WILDCARD),
            ResourceId::Content(id) => write!(f, "{id}"),
        }
    }
}

impl FromStr for ResourceId {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        if s == WILDCARD {
            Ok(ResourceId::Wildcard)
        } else {
            s.parse().map(ResourceId::Content)
        }
    }
}

/// The action a grant permits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbilityKind {
    /// Run sandboxed code on the quorum
    ExecuteAction,
    /// Produce signatures with a delegated identity
    SignWithIdentity,
    /// Decrypt material gated by an access condition
    ReadAccessCondition,
    /// Sign material gated by an access condition
    SignAccessCondition,
}

impl AbilityKind {
    /// All abilities, in declaration order
    pub const ALL: [AbilityKind; 4] = [
        AbilityKind::ExecuteAction,
        AbilityKind::SignWithIdentity,
        AbilityKind::ReadAccessCondition,
        AbilityKind::SignAccessCondition,
    ];

    /// URI scheme for resources this ability acts on
    pub fn resource_prefix(&self) -> &'static str {
        match self {
            AbilityKind::ExecuteAction => "action",
            AbilityKind::SignWithIdentity => "identity",
            AbilityKind::ReadAccessCondition | AbilityKind::SignAccessCondition => "condition",
        }
    }

    /// Ability string inside the capability object
    pub fn recap_ability(&self) -> &'static str {
        match self {
            AbilityKind::ExecuteAction => "Threshold/Execution",
            AbilityKind::SignWithIdentity | AbilityKind::SignAccessCondition => {
                "Threshold/Signing"
            }
            AbilityKind::ReadAccessCondition => "Threshold/Decryption",
        }
    }

    /// Inverse of (`resource_prefix`, `recap_ability`)
    pub fn from_recap(prefix: &str, ability: &str) -> Option<AbilityKind> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.resource_prefix() == prefix && kind.recap_ability() == ability)
    }
}

/// Additional constraint on how a grant may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScopeKind {
    /// No additional constraint
    #[default]
    Unscoped,
    /// Identity may sign arbitrary payloads
    SignAnything,
    /// Identity may only sign prefixed personal messages
    PersonalSign,
}

impl ScopeKind {
    /// Caveat value used in the capability object, `None` for `Unscoped`
    pub fn caveat(&self) -> Option<&'static str> {
        match self {
            ScopeKind::Unscoped => None,
            ScopeKind::SignAnything => Some("sign-anything"),
            ScopeKind::PersonalSign => Some("personal-sign"),
        }
    }

    /// Inverse of [`ScopeKind::caveat`]
    pub fn from_caveat(value: Option<&str>) -> Option<ScopeKind> {
        match value {
            None => Some(ScopeKind::Unscoped),
            Some("sign-anything") => Some(ScopeKind::SignAnything),
            Some("personal-sign") => Some(ScopeKind::PersonalSign),
            Some(_) => None,
        }
    }
}

/// A single `(resource, ability, scope)` triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapabilityGrant {
    /// Resource the grant applies to
    pub resource: ResourceId,
    /// Action permitted on the resource
    pub ability: AbilityKind,
    /// Additional constraint
    pub scope: ScopeKind,
}

impl CapabilityGrant {
    /// Build a grant. Pure; wildcard execution grants are logged because
    /// they authorize arbitrary code.
    pub fn build(resource: ResourceId, ability: AbilityKind, scope: ScopeKind) -> Self {
        if resource == ResourceId::Wildcard && ability == AbilityKind::ExecuteAction {
            tracing::warn!("wildcard execution grant built; authorizes any payload");
        }
        Self {
            resource,
            ability,
            scope,
        }
    }

    /// Grant to execute exactly the payload identified by `content_id`
    pub fn execute(content_id: ContentId) -> Self {
        Self::build(
            ResourceId::Content(content_id),
            AbilityKind::ExecuteAction,
            ScopeKind::Unscoped,
        )
    }

    /// Resource URI, e.g. `action://*`
    pub fn resource_uri(&self) -> String {
        format!("{}://{}", self.ability.resource_prefix(), self.resource)
    }

    /// Whether this grant permits `ability` on `content_id`
    pub fn authorizes(&self, ability: AbilityKind, content_id: &ContentId) -> bool {
        self.ability == ability && self.resource.matches(content_id)
    }
}

/// Resolve the resource for a code payload.
///
/// Must be called with the exact bytes that will be dispatched.
pub fn resource_for_code<A: ContentAddressing + ?Sized>(addresser: &A, code: &[u8]) -> ResourceId {
    ResourceId::Content(addresser.content_id(code))
}

/// Ordered set of grants negotiated together
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<CapabilityGrant>", into = "Vec<CapabilityGrant>")]
pub struct CapabilitySet(Vec<CapabilityGrant>);

impl CapabilitySet {
    /// Build a set, preserving order. Two grants for the same resource and
    /// ability are rejected since their scopes would be ambiguous.
    pub fn new(grants: Vec<CapabilityGrant>) -> Result<Self> {
        for (i, grant) in grants.iter().enumerate() {
            if grants[..i]
                .iter()
                .any(|g| g.resource == grant.resource && g.ability == grant.ability)
            {
                return Err(TesseraError::invalid_delegation(format!(
                    "duplicate grant for {} / {:?}",
                    grant.resource_uri(),
                    grant.ability
                )));
            }
        }
        Ok(Self(grants))
    }

    /// Set authorizing execution of exactly one payload
    pub fn execution_for(content_id: ContentId) -> Self {
        Self(vec![CapabilityGrant::execute(content_id)])
    }

    /// Grants in negotiation order
    pub fn grants(&self) -> &[CapabilityGrant] {
        &self.0
    }

    /// Whether the set holds no grants
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of grants
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether any grant permits executing `content_id`
    pub fn authorizes_execution(&self, content_id: &ContentId) -> bool {
        self.0
            .iter()
            .any(|g| g.authorizes(AbilityKind::ExecuteAction, content_id))
    }

    /// Whether any grant uses the wildcard resource
    pub fn is_wildcard(&self) -> bool {
        self.0.iter().any(|g| g.resource == ResourceId::Wildcard)
    }

    /// Resource URIs in grant order
    pub fn resource_uris(&self) -> Vec<String> {
        self.0.iter().map(CapabilityGrant::resource_uri).collect()
    }

    /// Whether both sets hold exactly the same grants, ignoring order
    pub fn same_grants(&self, other: &CapabilitySet) -> bool {
        self.0.len() == other.0.len() && self.0.iter().all(|g| other.0.contains(g))
    }
}

impl TryFrom<Vec<CapabilityGrant>> for CapabilitySet {
    type Error = TesseraError;

    fn try_from(grants: Vec<CapabilityGrant>) -> Result<Self> {
        Self::new(grants)
    }
}

impl From<CapabilitySet> for Vec<CapabilityGrant> {
    fn from(set: CapabilitySet) -> Self {
        set.0
    }
}
