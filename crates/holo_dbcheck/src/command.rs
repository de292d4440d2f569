//! The `dbCheck` command entry point.
//!
//! Launch-time failures are returned to the caller. Once the job is spawned
//! the caller only ever sees `ok: true`; everything after that is visible
//! through the health log and the replicated log.

use serde::Serialize;
use serde_json::Value;

use crate::auth::UserContext;
use crate::context::{FeatureCompatibilityVersion, ServiceContext};
use crate::error::DbCheckError;
use crate::job::{DbCheckJob, JobHandle};
use crate::plan::{build_run_plan, Invocation};
use crate::types::RunPlan;

/// Lowest feature compatibility version that supports dbCheck.
pub const MIN_FCV: FeatureCompatibilityVersion = FeatureCompatibilityVersion::V36;

pub const HELP: &str = "Validate replica set consistency.\n\
Invoke with { dbCheck: <collection name/uuid>, minKey: <first key, exclusive>, \
maxKey: <last key, inclusive>, maxCount: <max number of docs>, maxSize: <max size of docs> } \
to check a collection.\n\
Invoke with { dbCheck: 1 } to check all collections in the database.";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errmsg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl CommandReply {
    pub fn success() -> Self {
        Self {
            ok: true,
            errmsg: None,
            code: None,
        }
    }

    pub fn failure(err: &DbCheckError) -> Self {
        Self {
            ok: false,
            errmsg: Some(err.to_string()),
            code: Some(err.code() as i32),
        }
    }
}

pub struct DbCheckCommand {
    service: ServiceContext,
}

impl DbCheckCommand {
    pub fn new(service: ServiceContext) -> Self {
        Self { service }
    }

    /// Validate `cmd` against `db` and start the job in the background.
    pub async fn run(&self, db: &str, cmd: &Value, user: &UserContext) -> CommandReply {
        let (reply, _detached) = self.launch(db, cmd, user).await;
        reply
    }

    /// Like [`run`](Self::run), but keeps a handle on the spawned job.
    pub async fn launch(
        &self,
        db: &str,
        cmd: &Value,
        user: &UserContext,
    ) -> (CommandReply, Option<JobHandle>) {
        match self.prepare(db, cmd, user).await {
            Ok(plan) => {
                let handle = DbCheckJob::new(self.service.clone(), db, plan).spawn();
                (CommandReply::success(), Some(handle))
            }
            Err(err) => {
                tracing::info!(db, error = %err, "dbCheck rejected");
                (CommandReply::failure(&err), None)
            }
        }
    }

    async fn prepare(
        &self,
        db: &str,
        cmd: &Value,
        user: &UserContext,
    ) -> Result<RunPlan, DbCheckError> {
        let invocation = Invocation::parse(cmd)?;
        let target = invocation.auth_namespace(&self.service, db);
        self.service.authorizer.check_find(user, &target)?;
        if self.service.fcv < MIN_FCV {
            return Err(DbCheckError::UnsupportedFeatureVersion {
                required: MIN_FCV.to_string(),
                current: self.service.fcv.to_string(),
            });
        }
        build_run_plan(&self.service, db, &invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::DatabaseAuthorizer;
    use crate::context::testing::harness;
    use crate::types::Namespace;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn rejections_carry_codes() {
        let h = harness();
        h.catalog
            .create_collection(&Namespace::new("db", "c"), json!({}), Vec::new())
            .unwrap();
        let cmd = DbCheckCommand::new(h.service.clone());
        let user = UserContext::default();

        let reply = cmd.run("db", &json!({"dbCheck": "nope"}), &user).await;
        assert!(!reply.ok);
        assert_eq!(reply.code, Some(26));
        assert_eq!(reply.errmsg.as_deref(), Some("Collection nope not found"));

        let reply = cmd.run("local", &json!({"dbCheck": 1}), &user).await;
        assert_eq!(reply.code, Some(73));

        let reply = cmd.run("db", &json!("dbCheck"), &user).await;
        assert_eq!(reply.code, Some(2));
    }

    #[tokio::test]
    async fn authorization_runs_before_version_check() {
        let h = harness();
        let service = h
            .service
            .clone()
            .with_fcv(FeatureCompatibilityVersion::V34)
            .with_authorizer(Arc::new(DatabaseAuthorizer::new().grant_read("ops", "db")));
        let cmd = DbCheckCommand::new(service);

        let reply = cmd
            .run("db", &json!({"dbCheck": 1}), &UserContext::named("guest"))
            .await;
        assert_eq!(reply.code, Some(13));

        let reply = cmd
            .run("db", &json!({"dbCheck": 1}), &UserContext::named("ops"))
            .await;
        assert_eq!(reply.code, Some(40614));
    }

    #[tokio::test]
    async fn accepted_command_replies_before_the_job_finishes() {
        let h = harness();
        h.catalog
            .create_collection(&Namespace::new("db", "c"), json!({}), Vec::new())
            .unwrap();
        let cmd = DbCheckCommand::new(h.service.clone());
        let (reply, handle) = cmd
            .launch("db", &json!({"dbCheck": "c"}), &UserContext::default())
            .await;
        assert_eq!(reply, CommandReply::success());
        let report = handle.expect("job handle").wait().await.unwrap();
        assert_eq!(report.collections.len(), 1);
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"ok": true})
        );
    }
}
