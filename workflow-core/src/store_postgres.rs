use crate::error::{Result, WorkflowError};
use crate::events::RuntimeEvent;
use crate::store::DataAccess;
use crate::types::*;
use async_trait::async_trait;
use sqlx::Row;
use std::collections::BTreeMap;
use uuid::Uuid;

/// `ExecutionKey` flattened into the three columns used as part of its
/// primary key in every per-key table: `kind` discriminates the variant,
/// `scope` is the fully-qualified name, `idx` is the (nullable) shard index.
fn key_columns(key: &ExecutionKey) -> (&'static str, &str, Option<i64>) {
    match key {
        ExecutionKey::Call { scope, index } => ("call", scope.fully_qualified_name(), *index),
        ExecutionKey::Scatter { scope, index } => ("scatter", scope.fully_qualified_name(), *index),
        ExecutionKey::Collector { scope } => ("collector", scope.fully_qualified_name(), None),
    }
}

fn key_from_columns(kind: &str, scope: &str, idx: Option<i64>) -> Result<ExecutionKey> {
    let scope = Scope::new(scope);
    match kind {
        "call" => Ok(ExecutionKey::Call { scope, index: idx }),
        "scatter" => Ok(ExecutionKey::Scatter { scope, index: idx }),
        "collector" => Ok(ExecutionKey::Collector { scope }),
        other => Err(WorkflowError::Persistence(format!(
            "unknown execution key kind `{other}` in storage row"
        ))),
    }
}

/// PostgreSQL-backed implementation of `DataAccess`.
pub struct PostgresDataAccess {
    pool: sqlx::PgPool,
}

impl PostgresDataAccess {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Run embedded migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| WorkflowError::Persistence(e.to_string()))?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value> {
    serde_json::to_value(v).map_err(|e| WorkflowError::Persistence(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(v: serde_json::Value) -> Result<T> {
    serde_json::from_value(v).map_err(|e| WorkflowError::Persistence(e.to_string()))
}

/// Materialize a call's persisted `CallOutputs` row as `Symbol` rows, the
/// shape the Symbol Resolver reads regardless of backend.
fn symbols_from_call_outputs(key: &ExecutionKey, outputs: &CallOutputs) -> Vec<Symbol> {
    outputs
        .iter()
        .map(|(name, value)| Symbol {
            scope: key.scope().clone(),
            name: name.clone(),
            index: key.index(),
            is_input: false,
            wdl_type: value.type_name().to_string(),
            wdl_value: Some(value.clone()),
        })
        .collect()
}

#[async_trait]
impl DataAccess for PostgresDataAccess {
    async fn create_workflow(
        &self,
        descriptor: &WorkflowDescriptor,
        symbols: &[Symbol],
        calls: &[ExecutionKey],
    ) -> Result<()> {
        let options_json = to_json(&descriptor.workflow_options)?;
        let state_json = to_json(&WorkflowState::Submitted)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id, namespace, workflow_options, state)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id) DO NOTHING
            "#,
        )
        .bind(descriptor.id)
        .bind(&descriptor.namespace)
        .bind(&options_json)
        .bind(&state_json)
        .execute(&mut *tx)
        .await?;

        for key in calls {
            let (kind, scope, idx) = key_columns(key);
            let status_json = to_json(&CallStatus::new(ExecutionStatus::NotStarted))?;
            sqlx::query(
                r#"
                INSERT INTO execution_status (workflow_id, kind, scope, idx, status)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (workflow_id, kind, scope, idx) DO NOTHING
                "#,
            )
            .bind(descriptor.id)
            .bind(kind)
            .bind(scope)
            .bind(idx)
            .bind(&status_json)
            .execute(&mut *tx)
            .await?;
        }

        for symbol in symbols {
            insert_symbol(&mut tx, descriptor.id, symbol).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_execution_statuses(
        &self,
        workflow_id: Uuid,
    ) -> Result<BTreeMap<ExecutionKey, CallStatus>> {
        let rows = sqlx::query(
            "SELECT kind, scope, idx, status FROM execution_status WHERE workflow_id = $1",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeMap::new();
        for row in rows {
            let kind: String = row.get("kind");
            let scope: String = row.get("scope");
            let idx: Option<i64> = row.get("idx");
            let status_json: serde_json::Value = row.get("status");
            let key = key_from_columns(&kind, &scope, idx)?;
            out.insert(key, from_json(status_json)?);
        }
        Ok(out)
    }

    async fn set_status(
        &self,
        workflow_id: Uuid,
        keys: &[ExecutionKey],
        status: CallStatus,
    ) -> Result<()> {
        let status_json = to_json(&status)?;
        let mut tx = self.pool.begin().await?;
        for key in keys {
            let (kind, scope, idx) = key_columns(key);
            sqlx::query(
                r#"
                INSERT INTO execution_status (workflow_id, kind, scope, idx, status)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (workflow_id, kind, scope, idx)
                DO UPDATE SET status = EXCLUDED.status
                "#,
            )
            .bind(workflow_id)
            .bind(kind)
            .bind(scope)
            .bind(idx)
            .bind(&status_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn set_outputs(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        outputs: &CallOutputs,
    ) -> Result<()> {
        let (kind, scope, idx) = key_columns(key);
        let outputs_json = to_json(outputs)?;
        sqlx::query(
            r#"
            INSERT INTO call_outputs (workflow_id, kind, scope, idx, outputs)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workflow_id, kind, scope, idx)
            DO UPDATE SET outputs = EXCLUDED.outputs
            "#,
        )
        .bind(workflow_id)
        .bind(kind)
        .bind(scope)
        .bind(idx)
        .bind(&outputs_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_calls(&self, workflow_id: Uuid, keys: &[ExecutionKey]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in keys {
            let (kind, scope, idx) = key_columns(key);
            let status_json = to_json(&CallStatus::new(ExecutionStatus::NotStarted))?;
            sqlx::query(
                r#"
                INSERT INTO execution_status (workflow_id, kind, scope, idx, status)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (workflow_id, kind, scope, idx) DO NOTHING
                "#,
            )
            .bind(workflow_id)
            .bind(kind)
            .bind(scope)
            .bind(idx)
            .bind(&status_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_workflow_state(&self, workflow_id: Uuid, state: WorkflowState) -> Result<()> {
        let state_json = to_json(&state)?;
        sqlx::query("UPDATE workflows SET state = $1 WHERE workflow_id = $2")
            .bind(&state_json)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_workflow_state(&self, workflow_id: Uuid) -> Result<Option<WorkflowState>> {
        let row = sqlx::query("SELECT state FROM workflows WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let state_json: serde_json::Value = row.get("state");
                Ok(Some(from_json(state_json)?))
            }
        }
    }

    async fn get_inputs(&self, workflow_id: Uuid, call: &Scope) -> Result<Vec<Symbol>> {
        let rows = sqlx::query(
            r#"
            SELECT scope, name, idx, is_input, wdl_type, wdl_value
            FROM symbols
            WHERE workflow_id = $1 AND scope = $2 AND is_input = TRUE
            "#,
        )
        .bind(workflow_id)
        .bind(call.fully_qualified_name())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(symbol_from_row).collect()
    }

    async fn get_outputs(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<Vec<Symbol>> {
        let (kind, scope, idx) = key_columns(key);
        let row = sqlx::query(
            r#"
            SELECT outputs FROM call_outputs
            WHERE workflow_id = $1 AND kind = $2 AND scope = $3 AND idx IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(workflow_id)
        .bind(kind)
        .bind(scope)
        .bind(idx)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let outputs_json: serde_json::Value = row.get("outputs");
        let outputs: CallOutputs = from_json(outputs_json)?;
        Ok(symbols_from_call_outputs(key, &outputs))
    }

    async fn get_fully_qualified_name(
        &self,
        workflow_id: Uuid,
        fqn: &str,
    ) -> Result<Vec<Symbol>> {
        let rows = sqlx::query(
            r#"
            SELECT scope, name, idx, is_input, wdl_type, wdl_value
            FROM symbols
            WHERE workflow_id = $1 AND scope = $2
            "#,
        )
        .bind(workflow_id)
        .bind(fqn)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(symbol_from_row).collect()
    }

    async fn put_symbol(&self, workflow_id: Uuid, symbol: Symbol) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_symbol(&mut tx, workflow_id, &symbol).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_workflow_options(
        &self,
        workflow_id: Uuid,
        options: WorkflowOptions,
    ) -> Result<()> {
        let options_json = to_json(&options)?;
        sqlx::query("UPDATE workflows SET workflow_options = $1 WHERE workflow_id = $2")
            .bind(&options_json)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job_paths(&self, workflow_id: Uuid, key: &ExecutionKey) -> Result<JobPaths> {
        let (kind, scope, idx) = key_columns(key);
        let row = sqlx::query(
            r#"
            SELECT call_root, detritus FROM job_paths
            WHERE workflow_id = $1 AND kind = $2 AND scope = $3 AND idx IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(workflow_id)
        .bind(kind)
        .bind(scope)
        .bind(idx)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(JobPaths::default()),
            Some(row) => {
                let call_root: String = row.get("call_root");
                let detritus_json: serde_json::Value = row.get("detritus");
                Ok(JobPaths {
                    call_root,
                    detritus: from_json(detritus_json)?,
                })
            }
        }
    }

    async fn save_job_paths(
        &self,
        workflow_id: Uuid,
        key: &ExecutionKey,
        paths: &JobPaths,
    ) -> Result<()> {
        let (kind, scope, idx) = key_columns(key);
        let detritus_json = to_json(&paths.detritus)?;
        sqlx::query(
            r#"
            INSERT INTO job_paths (workflow_id, kind, scope, idx, call_root, detritus)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_id, kind, scope, idx)
            DO UPDATE SET call_root = EXCLUDED.call_root, detritus = EXCLUDED.detritus
            "#,
        )
        .bind(workflow_id)
        .bind(kind)
        .bind(scope)
        .bind(idx)
        .bind(&paths.call_root)
        .bind(&detritus_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_failure_message(&self, workflow_id: Uuid, message: &str) -> Result<()> {
        sqlx::query("UPDATE workflows SET failure_message = $1 WHERE workflow_id = $2")
            .bind(message)
            .bind(workflow_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_failure_message(&self, workflow_id: Uuid) -> Result<Option<String>> {
        let row = sqlx::query("SELECT failure_message FROM workflows WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get("failure_message")))
    }

    async fn append_event(&self, workflow_id: Uuid, event: RuntimeEvent) -> Result<u64> {
        let event_json = to_json(&event)?;
        let row = sqlx::query(
            r#"
            INSERT INTO workflow_events (workflow_id, seq, event)
            VALUES ($1, COALESCE(
                (SELECT MAX(seq) + 1 FROM workflow_events WHERE workflow_id = $1), 0
            ), $2)
            RETURNING seq
            "#,
        )
        .bind(workflow_id)
        .bind(&event_json)
        .fetch_one(&self.pool)
        .await?;
        let seq: i64 = row.get("seq");
        Ok(seq as u64)
    }

    async fn read_events(
        &self,
        workflow_id: Uuid,
        from_seq: u64,
    ) -> Result<Vec<(u64, RuntimeEvent)>> {
        let rows = sqlx::query(
            "SELECT seq, event FROM workflow_events WHERE workflow_id = $1 AND seq >= $2 ORDER BY seq",
        )
        .bind(workflow_id)
        .bind(from_seq as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                let seq: i64 = row.get("seq");
                let event_json: serde_json::Value = row.get("event");
                Ok((seq as u64, from_json(event_json)?))
            })
            .collect()
    }
}

async fn insert_symbol(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workflow_id: Uuid,
    symbol: &Symbol,
) -> Result<()> {
    let value_json = to_json(&symbol.wdl_value)?;
    sqlx::query(
        r#"
        INSERT INTO symbols (workflow_id, scope, name, idx, is_input, wdl_type, wdl_value)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (workflow_id, scope, name, idx, is_input)
        DO UPDATE SET wdl_value = EXCLUDED.wdl_value
        "#,
    )
    .bind(workflow_id)
    .bind(symbol.scope.fully_qualified_name())
    .bind(&symbol.name)
    .bind(symbol.index)
    .bind(symbol.is_input)
    .bind(&symbol.wdl_type)
    .bind(&value_json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn symbol_from_row(row: sqlx::postgres::PgRow) -> Result<Symbol> {
    let scope: String = row.get("scope");
    let name: String = row.get("name");
    let idx: Option<i64> = row.get("idx");
    let is_input: bool = row.get("is_input");
    let wdl_type: String = row.get("wdl_type");
    let value_json: serde_json::Value = row.get("wdl_value");
    Ok(Symbol {
        scope: Scope::new(scope),
        name,
        index: idx,
        is_input,
        wdl_type,
        wdl_value: from_json(value_json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_columns_round_trip() {
        let key = ExecutionKey::Call {
            scope: Scope::new("wf.scatter0.A"),
            index: Some(2),
        };
        let (kind, scope, idx) = key_columns(&key);
        assert_eq!(key_from_columns(kind, scope, idx).unwrap(), key);

        let collector = ExecutionKey::Collector {
            scope: Scope::new("wf.scatter0.A"),
        };
        let (kind, scope, idx) = key_columns(&collector);
        assert_eq!(key_from_columns(kind, scope, idx).unwrap(), collector);
    }
}
