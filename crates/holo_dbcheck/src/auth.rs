//! Authorization collaborator. dbCheck requires the same privilege as a find.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::DbCheckError;
use crate::types::Namespace;

/// Identity of the caller issuing the command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserContext {
    pub user: Option<String>,
}

impl UserContext {
    pub fn named(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
        }
    }
}

pub trait Authorizer: Send + Sync + 'static {
    fn check_find(&self, user: &UserContext, nss: &Namespace) -> Result<(), DbCheckError>;
}

/// Grants everything; used when authorization is disabled.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check_find(&self, _user: &UserContext, _nss: &Namespace) -> Result<(), DbCheckError> {
        Ok(())
    }
}

/// Per-user read grants on whole databases.
#[derive(Clone, Debug, Default)]
pub struct DatabaseAuthorizer {
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl DatabaseAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_read(mut self, user: &str, db: &str) -> Self {
        self.grants
            .entry(user.to_string())
            .or_default()
            .insert(db.to_string());
        self
    }
}

impl Authorizer for DatabaseAuthorizer {
    fn check_find(&self, user: &UserContext, nss: &Namespace) -> Result<(), DbCheckError> {
        let allowed = user
            .user
            .as_ref()
            .and_then(|name| self.grants.get(name))
            .is_some_and(|dbs| dbs.contains(&nss.db));
        if allowed {
            Ok(())
        } else {
            Err(DbCheckError::Unauthorized(nss.to_string()))
        }
    }
}
