//! Access Control Gate
//!
//! Decides whether a requester may see a persisted schema or thread. The
//! checks are pure; callers consult them before handing a record out.
//!
//! | Level     | Visible to                         |
//! |-----------|------------------------------------|
//! | Private   | owner                              |
//! | Exclusive | owner and every id in the allow-list |
//! | Public    | any authenticated requester        |

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::schema::{AccessLevel, Schema};

/// A record carrying ownership and an access policy
pub trait Shareable {
    fn owner(&self) -> &str;
    fn access_level(&self) -> AccessLevel;
    fn allowed_users(&self) -> &BTreeSet<String>;
}

impl Shareable for Schema {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    fn allowed_users(&self) -> &BTreeSet<String> {
        &self.allowed_users
    }
}

/// Whether `requester` may view `record`. `None` is an unauthenticated caller.
pub fn can_view<T: Shareable + ?Sized>(requester: Option<&str>, record: &T) -> bool {
    let Some(requester) = requester else {
        return false;
    };
    if requester == record.owner() {
        return true;
    }
    match record.access_level() {
        AccessLevel::Public => true,
        AccessLevel::Exclusive => record.allowed_users().contains(requester),
        AccessLevel::Private => false,
    }
}

/// Like [`can_view`], but a denial becomes an auth error naming the record.
pub fn require_view<T: Shareable + ?Sized>(
    requester: Option<&str>,
    record: &T,
    what: &str,
) -> Result<()> {
    if can_view(requester, record) {
        return Ok(());
    }
    Err(match requester {
        Some(user) => Error::auth(format!("user '{}' cannot view {}", user, what)),
        None => Error::auth(format!("sign in to view {}", what)),
    })
}

/// Owner-only check for mutating operations
pub fn require_owner<T: Shareable + ?Sized>(requester: &str, record: &T, what: &str) -> Result<()> {
    if requester == record.owner() {
        Ok(())
    } else {
        Err(Error::auth(format!(
            "only the owner can modify {} (requested by '{}')",
            what, requester
        )))
    }
}

// ─────────────────────────────────────────────────────────────────
// Schema browser buckets
// ─────────────────────────────────────────────────────────────────

/// Schemas visible to a requester, grouped the way the browser shows them
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaBuckets {
    /// Schemas the requester owns
    pub owned: Vec<Schema>,
    /// Exclusive schemas shared with the requester
    pub shared: Vec<Schema>,
    /// Public schemas owned by someone else
    pub public: Vec<Schema>,
}

impl SchemaBuckets {
    pub fn len(&self) -> usize {
        self.owned.len() + self.shared.len() + self.public.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Split schemas into owned, shared and public buckets, dropping what the
/// requester cannot see.
pub fn partition(requester: Option<&str>, schemas: impl IntoIterator<Item = Schema>) -> SchemaBuckets {
    let mut buckets = SchemaBuckets::default();
    let Some(user) = requester else {
        return buckets;
    };
    for schema in schemas {
        if schema.owner == user {
            buckets.owned.push(schema);
        } else if !can_view(requester, &schema) {
            continue;
        } else if schema.access_level == AccessLevel::Exclusive {
            buckets.shared.push(schema);
        } else {
            buckets.public.push(schema);
        }
    }
    buckets
}

// ─────────────────────────────────────────────────────────────────
// User directory
// ─────────────────────────────────────────────────────────────────

/// Resolves the email addresses typed into a share dialog to user ids
pub trait UserDirectory: Send + Sync {
    fn resolve_email(&self, email: &str) -> Option<String>;
}

/// Fixed email → id table. Lookups ignore case and surrounding whitespace.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    users: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, email: &str, user_id: impl Into<String>) -> Self {
        self.insert(email, user_id);
        self
    }

    pub fn insert(&mut self, email: &str, user_id: impl Into<String>) {
        self.users.insert(normalize_email(email), user_id.into());
    }
}

impl UserDirectory for StaticDirectory {
    fn resolve_email(&self, email: &str) -> Option<String> {
        self.users.get(&normalize_email(email)).cloned()
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn schema(id: &str, owner: &str, level: AccessLevel, allowed: &[&str]) -> Schema {
        Schema {
            id: id.into(),
            name: id.into(),
            owner: owner.into(),
            access_level: level,
            allowed_users: allowed.iter().map(|s| s.to_string()).collect(),
            steps: vec![],
            created_at: Utc::now(),
            version: 1,
            previous_version: None,
        }
    }

    #[test]
    fn test_exclusive_visibility() {
        let s = schema("s", "owner", AccessLevel::Exclusive, &["u1"]);
        assert!(can_view(Some("u1"), &s));
        assert!(can_view(Some("owner"), &s));
        assert!(!can_view(Some("u2"), &s));
    }

    #[test]
    fn test_private_and_public() {
        let private = schema("a", "owner", AccessLevel::Private, &[]);
        assert!(can_view(Some("owner"), &private));
        assert!(!can_view(Some("u1"), &private));

        let public = schema("b", "owner", AccessLevel::Public, &[]);
        assert!(can_view(Some("anyone"), &public));
    }

    #[test]
    fn test_unauthenticated_sees_nothing() {
        let public = schema("b", "owner", AccessLevel::Public, &[]);
        assert!(!can_view(None, &public));
        let err = require_view(None, &public, "schema 'b'").unwrap_err();
        assert!(matches!(err, Error::Auth { .. }));
    }

    #[test]
    fn test_require_owner() {
        let s = schema("s", "owner", AccessLevel::Public, &[]);
        assert!(require_owner("owner", &s, "schema 's'").is_ok());
        assert!(require_owner("u1", &s, "schema 's'").is_err());
    }

    #[test]
    fn test_partition_buckets() {
        let buckets = partition(
            Some("u1"),
            vec![
                schema("mine", "u1", AccessLevel::Private, &[]),
                schema("mine-public", "u1", AccessLevel::Public, &[]),
                schema("shared", "u2", AccessLevel::Exclusive, &["u1"]),
                schema("not-shared", "u2", AccessLevel::Exclusive, &["u3"]),
                schema("hidden", "u2", AccessLevel::Private, &[]),
                schema("open", "u3", AccessLevel::Public, &[]),
            ],
        );
        let names = |v: &Vec<Schema>| v.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        assert_eq!(names(&buckets.owned), vec!["mine", "mine-public"]);
        assert_eq!(names(&buckets.shared), vec!["shared"]);
        assert_eq!(names(&buckets.public), vec!["open"]);
        assert_eq!(buckets.len(), 4);

        assert!(partition(None, vec![schema("open", "u3", AccessLevel::Public, &[])]).is_empty());
    }

    #[test]
    fn test_static_directory() {
        let dir = StaticDirectory::new().with_user("Ada@Example.com", "u-ada");
        assert_eq!(dir.resolve_email(" ada@example.com ").as_deref(), Some("u-ada"));
        assert!(dir.resolve_email("bob@example.com").is_none());
    }
}
