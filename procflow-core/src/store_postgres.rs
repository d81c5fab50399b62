use crate::store::ProcessStore;
use crate::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;
use uuid::Uuid;

/// Embedded schema. Applied once at worker startup; every statement is
/// idempotent so replicas can race on it.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS proc_def (
    id text NOT NULL,
    name text,
    definition jsonb,
    bpmn text,
    tenant_id text NOT NULL,
    isdeleted boolean NOT NULL DEFAULT false,
    uuid uuid NOT NULL DEFAULT gen_random_uuid(),
    PRIMARY KEY (id, tenant_id)
);

CREATE TABLE IF NOT EXISTS proc_def_arcv (
    proc_def_id text NOT NULL,
    arcv_id text NOT NULL,
    version integer NOT NULL DEFAULT 1,
    definition jsonb,
    tenant_id text NOT NULL,
    PRIMARY KEY (proc_def_id, arcv_id, tenant_id)
);

CREATE TABLE IF NOT EXISTS form_def (
    id text NOT NULL,
    html text,
    proc_def_id text,
    activity_id text,
    fields_json jsonb,
    tenant_id text NOT NULL,
    PRIMARY KEY (id, tenant_id)
);

CREATE TABLE IF NOT EXISTS bpm_proc_inst (
    proc_inst_id text NOT NULL,
    proc_inst_name text,
    proc_def_id text,
    proc_def_version text,
    current_activity_ids text[] NOT NULL DEFAULT '{}',
    current_user_ids text[] NOT NULL DEFAULT '{}',
    participants text[] NOT NULL DEFAULT '{}',
    role_bindings jsonb NOT NULL DEFAULT '[]',
    variables_data jsonb NOT NULL DEFAULT '[]',
    status text,
    tenant_id text NOT NULL,
    is_clean_up boolean NOT NULL DEFAULT false,
    PRIMARY KEY (proc_inst_id, tenant_id)
);

CREATE TABLE IF NOT EXISTS todolist (
    id uuid PRIMARY KEY,
    proc_inst_id text,
    proc_def_id text,
    activity_id text NOT NULL,
    activity_name text,
    user_id text,
    username text,
    status text NOT NULL,
    assignees jsonb NOT NULL DEFAULT '[]',
    reference_ids text[] NOT NULL DEFAULT '{}',
    duration integer,
    output jsonb,
    draft jsonb,
    feedback jsonb,
    tool text,
    start_date timestamptz,
    end_date timestamptz,
    due_date timestamptz,
    retry integer NOT NULL DEFAULT 0,
    consumer text,
    log text,
    agent_mode text,
    agent_orch text,
    temp_feedback text,
    execution_scope text,
    rework_count integer NOT NULL DEFAULT 0,
    project_id text,
    root_proc_inst_id text,
    query text,
    tenant_id text NOT NULL,
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_todolist_claim ON todolist (status, consumer);
CREATE INDEX IF NOT EXISTS idx_todolist_instance ON todolist (proc_inst_id, tenant_id);

CREATE TABLE IF NOT EXISTS events (
    id uuid PRIMARY KEY,
    run_id text,
    job_id text,
    todo_id uuid,
    proc_inst_id text,
    event_type text NOT NULL,
    crew_type text,
    data jsonb,
    timestamp timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS idx_events_instance ON events (proc_inst_id);

CREATE TABLE IF NOT EXISTS mcp_python_code (
    proc_def_id text NOT NULL,
    activity_id text NOT NULL,
    tenant_id text NOT NULL,
    compensation text,
    created_at timestamptz NOT NULL DEFAULT now(),
    PRIMARY KEY (proc_def_id, activity_id, tenant_id)
);

CREATE TABLE IF NOT EXISTS chats (
    id text NOT NULL,
    uuid uuid PRIMARY KEY,
    messages jsonb,
    tenant_id text NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id text,
    email text PRIMARY KEY,
    username text,
    tenant_id text
);

CREATE TABLE IF NOT EXISTS agents (
    id text PRIMARY KEY,
    name text,
    url text,
    tenant_id text
);

CREATE TABLE IF NOT EXISTS configuration (
    key text NOT NULL,
    value jsonb,
    tenant_id text NOT NULL,
    PRIMARY KEY (key, tenant_id)
);
"#;

/// PostgreSQL-backed implementation of `ProcessStore`.
pub struct PostgresProcessStore {
    pool: sqlx::PgPool,
}

impl PostgresProcessStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply engine schema")?;
        Ok(())
    }
}

fn status_from_row(row: &PgRow) -> Result<WorkItemStatus> {
    let raw: String = row.try_get("status")?;
    WorkItemStatus::parse(&raw)
        .with_context(|| format!("unknown work item status in todolist row: {raw}"))
}

fn json_column(row: &PgRow, name: &str) -> Value {
    row.try_get::<Option<Value>, _>(name)
        .ok()
        .flatten()
        .unwrap_or(Value::Null)
}

fn workitem_from_row(row: &PgRow) -> Result<WorkItem> {
    let assignees: Vec<RoleBinding> = match json_column(row, "assignees") {
        Value::Null => Vec::new(),
        value => serde_json::from_value(value).context("failed to decode assignees")?,
    };
    let agent_mode: Option<String> = row.try_get("agent_mode")?;

    Ok(WorkItem {
        id: row.try_get("id")?,
        proc_inst_id: row.try_get("proc_inst_id")?,
        proc_def_id: row.try_get("proc_def_id")?,
        activity_id: row.try_get("activity_id")?,
        activity_name: row
            .try_get::<Option<String>, _>("activity_name")?
            .unwrap_or_default(),
        status: status_from_row(row)?,
        user_id: row.try_get("user_id")?,
        username: row.try_get("username")?,
        assignees,
        reference_ids: row
            .try_get::<Option<Vec<String>>, _>("reference_ids")?
            .unwrap_or_default(),
        duration: row.try_get("duration")?,
        tool: row.try_get("tool")?,
        output: json_column(row, "output"),
        draft: row.try_get::<Option<Value>, _>("draft")?,
        feedback: row.try_get::<Option<Value>, _>("feedback")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        due_date: row.try_get("due_date")?,
        retry: row.try_get("retry")?,
        consumer: row.try_get("consumer")?,
        log: row.try_get("log")?,
        agent_mode: agent_mode.as_deref().and_then(AgentMode::parse),
        agent_orch: row.try_get("agent_orch")?,
        temp_feedback: row.try_get("temp_feedback")?,
        rework_count: row.try_get("rework_count")?,
        query: row.try_get("query")?,
        tenant_id: row.try_get("tenant_id")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn instance_from_row(row: &PgRow) -> Result<ProcessInstance> {
    let role_bindings: Vec<RoleBinding> = match json_column(row, "role_bindings") {
        Value::Null => Vec::new(),
        value => serde_json::from_value(value).context("failed to decode role_bindings")?,
    };
    let variables_data: Vec<VariableEntry> = match json_column(row, "variables_data") {
        Value::Null => Vec::new(),
        // A bare object is accepted and wrapped, matching legacy rows.
        Value::Object(map) => vec![VariableEntry {
            key: "variables".to_string(),
            name: None,
            value: Value::Object(map),
        }],
        value => serde_json::from_value(value).context("failed to decode variables_data")?,
    };
    let status_raw: Option<String> = row.try_get("status")?;

    Ok(ProcessInstance {
        proc_inst_id: row.try_get("proc_inst_id")?,
        proc_inst_name: row.try_get("proc_inst_name")?,
        proc_def_id: row
            .try_get::<Option<String>, _>("proc_def_id")?
            .unwrap_or_default(),
        proc_def_version: row.try_get("proc_def_version")?,
        status: status_raw
            .as_deref()
            .and_then(InstanceStatus::parse)
            .unwrap_or(InstanceStatus::Running),
        current_activity_ids: row
            .try_get::<Option<Vec<String>>, _>("current_activity_ids")?
            .unwrap_or_default(),
        current_user_ids: row
            .try_get::<Option<Vec<String>>, _>("current_user_ids")?
            .unwrap_or_default(),
        participants: row
            .try_get::<Option<Vec<String>>, _>("participants")?
            .unwrap_or_default(),
        role_bindings,
        variables_data,
        tenant_id: row.try_get("tenant_id")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<EventEntry> {
    Ok(EventEntry {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        job_id: row.try_get("job_id")?,
        todo_id: row.try_get("todo_id")?,
        proc_inst_id: row.try_get("proc_inst_id")?,
        event_type: row.try_get("event_type")?,
        crew_type: row.try_get("crew_type")?,
        data: json_column(row, "data"),
        timestamp: row.try_get("timestamp")?,
    })
}

#[async_trait]
impl ProcessStore for PostgresProcessStore {
    // ── Definitions ──

    async fn fetch_process_definition(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT definition FROM proc_def
             WHERE id = $1 AND tenant_id = $2 AND isdeleted = false",
        )
        .bind(def_id.to_lowercase())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.try_get::<Option<Value>, _>("definition").ok().flatten()))
    }

    async fn fetch_latest_definition_version(
        &self,
        def_id: &str,
        tenant_id: &str,
    ) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT arcv_id FROM proc_def_arcv
             WHERE proc_def_id = $1 AND tenant_id = $2
             ORDER BY version DESC LIMIT 1",
        )
        .bind(def_id.to_lowercase())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.try_get("arcv_id").ok()))
    }

    async fn fetch_form_definition(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<FormDefinition>> {
        let row = sqlx::query(
            "SELECT id, html, proc_def_id, activity_id, fields_json FROM form_def
             WHERE proc_def_id = $1 AND activity_id = $2 AND tenant_id = $3",
        )
        .bind(proc_def_id)
        .bind(activity_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => Ok(Some(FormDefinition {
                id: row.try_get("id")?,
                html: row.try_get("html")?,
                proc_def_id: row.try_get("proc_def_id")?,
                activity_id: row.try_get("activity_id")?,
                fields_json: row.try_get::<Option<Value>, _>("fields_json")?,
            })),
        }
    }

    // ── Instances ──

    async fn fetch_process_instance(
        &self,
        proc_inst_id: &str,
        tenant_id: &str,
    ) -> Result<Option<ProcessInstance>> {
        let row = sqlx::query(
            "SELECT * FROM bpm_proc_inst WHERE proc_inst_id = $1 AND tenant_id = $2",
        )
        .bind(proc_inst_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| instance_from_row(&r)).transpose()
    }

    async fn upsert_process_instance(&self, instance: &ProcessInstance) -> Result<()> {
        let role_bindings = serde_json::to_value(&instance.role_bindings)?;
        let variables_data = serde_json::to_value(&instance.variables_data)?;

        sqlx::query(
            r#"
            INSERT INTO bpm_proc_inst (
                proc_inst_id, proc_inst_name, proc_def_id, proc_def_version,
                current_activity_ids, current_user_ids, participants,
                role_bindings, variables_data, status, tenant_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (proc_inst_id, tenant_id) DO UPDATE SET
                proc_inst_name = EXCLUDED.proc_inst_name,
                proc_def_id = EXCLUDED.proc_def_id,
                proc_def_version = EXCLUDED.proc_def_version,
                current_activity_ids = EXCLUDED.current_activity_ids,
                current_user_ids = EXCLUDED.current_user_ids,
                participants = EXCLUDED.participants,
                role_bindings = EXCLUDED.role_bindings,
                variables_data = EXCLUDED.variables_data,
                status = EXCLUDED.status
            "#,
        )
        .bind(&instance.proc_inst_id)
        .bind(&instance.proc_inst_name)
        .bind(instance.def_id().to_lowercase())
        .bind(&instance.proc_def_version)
        .bind(&instance.current_activity_ids)
        .bind(&instance.current_user_ids)
        .bind(&instance.participants)
        .bind(&role_bindings)
        .bind(&variables_data)
        .bind(instance.status.as_str())
        .bind(&instance.tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Work items ──

    async fn fetch_workitem(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let row = sqlx::query("SELECT * FROM todolist WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| workitem_from_row(&r)).transpose()
    }

    async fn fetch_workitem_by_instance_and_activity(
        &self,
        proc_inst_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<WorkItem>> {
        let row = sqlx::query(
            "SELECT * FROM todolist
             WHERE proc_inst_id = $1 AND activity_id = $2 AND tenant_id = $3
             ORDER BY updated_at DESC NULLS LAST, rework_count DESC
             LIMIT 1",
        )
        .bind(proc_inst_id)
        .bind(activity_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| workitem_from_row(&r)).transpose()
    }

    async fn fetch_todolist(&self, proc_inst_id: &str, tenant_id: &str) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query(
            "SELECT * FROM todolist
             WHERE proc_inst_id = $1 AND tenant_id = $2
             ORDER BY start_date ASC NULLS LAST",
        )
        .bind(proc_inst_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(workitem_from_row).collect()
    }

    async fn upsert_workitem(&self, item: &WorkItem) -> Result<()> {
        let assignees = serde_json::to_value(&item.assignees)?;

        sqlx::query(
            r#"
            INSERT INTO todolist (
                id, proc_inst_id, proc_def_id, activity_id, activity_name,
                user_id, username, status, assignees, reference_ids, duration,
                output, draft, feedback, tool, start_date, end_date, due_date,
                retry, consumer, log, agent_mode, agent_orch, temp_feedback,
                rework_count, query, tenant_id, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24,
                      $25, $26, $27, now())
            ON CONFLICT (id) DO UPDATE SET
                proc_inst_id = EXCLUDED.proc_inst_id,
                proc_def_id = EXCLUDED.proc_def_id,
                activity_id = EXCLUDED.activity_id,
                activity_name = EXCLUDED.activity_name,
                user_id = EXCLUDED.user_id,
                username = EXCLUDED.username,
                status = EXCLUDED.status,
                assignees = EXCLUDED.assignees,
                reference_ids = EXCLUDED.reference_ids,
                duration = EXCLUDED.duration,
                output = EXCLUDED.output,
                draft = EXCLUDED.draft,
                feedback = EXCLUDED.feedback,
                tool = EXCLUDED.tool,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                due_date = EXCLUDED.due_date,
                retry = EXCLUDED.retry,
                consumer = EXCLUDED.consumer,
                log = EXCLUDED.log,
                agent_mode = EXCLUDED.agent_mode,
                agent_orch = EXCLUDED.agent_orch,
                temp_feedback = EXCLUDED.temp_feedback,
                rework_count = EXCLUDED.rework_count,
                query = EXCLUDED.query,
                tenant_id = EXCLUDED.tenant_id,
                updated_at = now()
            "#,
        )
        .bind(item.id)
        .bind(&item.proc_inst_id)
        .bind(&item.proc_def_id)
        .bind(&item.activity_id)
        .bind(&item.activity_name)
        .bind(&item.user_id)
        .bind(&item.username)
        .bind(item.status.as_str())
        .bind(&assignees)
        .bind(&item.reference_ids)
        .bind(item.duration)
        .bind(&item.output)
        .bind(&item.draft)
        .bind(&item.feedback)
        .bind(&item.tool)
        .bind(item.start_date)
        .bind(item.end_date)
        .bind(item.due_date)
        .bind(item.retry)
        .bind(&item.consumer)
        .bind(&item.log)
        .bind(item.agent_mode.map(|m| m.as_str()))
        .bind(&item.agent_orch)
        .bind(&item.temp_feedback)
        .bind(item.rework_count)
        .bind(&item.query)
        .bind(&item.tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn patch_workitem(&self, id: Uuid, patch: &WorkItemPatch, tenant_id: &str) -> Result<()> {
        // Dynamic SET list: only the named columns are touched.
        let mut sets: Vec<String> = vec!["updated_at = now()".to_string()];
        let mut arg = 2u32;
        let mut next = |sets: &mut Vec<String>, column: &str| {
            arg += 1;
            sets.push(format!("{column} = ${arg}"));
        };

        if patch.status.is_some() {
            next(&mut sets, "status");
        }
        if patch.consumer.is_some() {
            next(&mut sets, "consumer");
        }
        if patch.log.is_some() {
            next(&mut sets, "log");
        }
        if patch.output.is_some() {
            next(&mut sets, "output");
        }
        if patch.retry.is_some() {
            next(&mut sets, "retry");
        }
        if patch.user_id.is_some() {
            next(&mut sets, "user_id");
        }
        if patch.username.is_some() {
            next(&mut sets, "username");
        }
        if patch.agent_mode.is_some() {
            next(&mut sets, "agent_mode");
        }
        if patch.agent_orch.is_some() {
            next(&mut sets, "agent_orch");
        }
        if patch.end_date.is_some() {
            next(&mut sets, "end_date");
        }

        let sql = format!(
            "UPDATE todolist SET {} WHERE id = $1 AND tenant_id = $2",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(id).bind(tenant_id);
        if let Some(status) = patch.status {
            query = query.bind(status.as_str());
        }
        if let Some(consumer) = &patch.consumer {
            query = query.bind(consumer.clone());
        }
        if let Some(log) = &patch.log {
            query = query.bind(log.clone());
        }
        if let Some(output) = &patch.output {
            query = query.bind(output.clone());
        }
        if let Some(retry) = patch.retry {
            query = query.bind(retry);
        }
        if let Some(user_id) = &patch.user_id {
            query = query.bind(user_id.clone());
        }
        if let Some(username) = &patch.username {
            query = query.bind(username.clone());
        }
        if let Some(agent_mode) = patch.agent_mode {
            query = query.bind(agent_mode.as_str());
        }
        if let Some(agent_orch) = &patch.agent_orch {
            query = query.bind(agent_orch.clone());
        }
        if let Some(end_date) = &patch.end_date {
            query = query.bind(*end_date);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_workitem(&self, id: Uuid, tenant_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM todolist WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Claim protocol ──

    async fn claim_submitted(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query(
            r#"
            WITH locked_rows AS (
                SELECT id FROM todolist
                WHERE status = 'SUBMITTED'
                    AND consumer IS NULL
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE todolist
            SET consumer = $2
            FROM locked_rows
            WHERE todolist.id = locked_rows.id
            RETURNING todolist.*
            "#,
        )
        .bind(limit)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await
        .context("claim of SUBMITTED work items failed")?;
        rows.iter().map(workitem_from_row).collect()
    }

    async fn claim_agent_in_progress(&self, limit: i64, consumer: &str) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query(
            r#"
            WITH locked_rows AS (
                SELECT id FROM todolist
                WHERE status = 'IN_PROGRESS'
                    AND consumer IS NULL
                    AND agent_mode = 'A2A'
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE todolist
            SET consumer = $2
            FROM locked_rows
            WHERE todolist.id = locked_rows.id
            RETURNING todolist.*
            "#,
        )
        .bind(limit)
        .bind(consumer)
        .fetch_all(&self.pool)
        .await
        .context("claim of A2A work items failed")?;
        rows.iter().map(workitem_from_row).collect()
    }

    async fn release_stale_claims(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let result = sqlx::query(
            "UPDATE todolist
             SET consumer = NULL
             WHERE status = 'IN_PROGRESS'
                 AND consumer IS NOT NULL
                 AND start_date < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    // ── Directory ──

    async fn fetch_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let row = sqlx::query("SELECT id, email, username FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(UserRecord {
                id: row
                    .try_get::<Option<String>, _>("id")?
                    .unwrap_or_else(|| email.to_string()),
                email: row.try_get("email")?,
                username: row.try_get("username")?,
            })),
        }
    }

    async fn fetch_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let row = sqlx::query("SELECT id, name, url FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(AgentRecord {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                url: row.try_get("url")?,
            })),
        }
    }

    // ── Event log ──

    async fn append_event(&self, event: &EventEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO events (id, run_id, job_id, todo_id, proc_inst_id,
                                event_type, crew_type, data, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(&event.run_id)
        .bind(&event.job_id)
        .bind(event.todo_id)
        .bind(&event.proc_inst_id)
        .bind(&event.event_type)
        .bind(&event.crew_type)
        .bind(&event.data)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_events(&self, proc_inst_id: &str, _tenant_id: &str) -> Result<Vec<EventEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE proc_inst_id = $1 ORDER BY timestamp ASC",
        )
        .bind(proc_inst_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    // ── Compensation artifacts ──

    async fn fetch_compensation(
        &self,
        proc_def_id: &str,
        activity_id: &str,
        tenant_id: &str,
    ) -> Result<Option<CompensationArtifact>> {
        let row = sqlx::query(
            "SELECT * FROM mcp_python_code
             WHERE proc_def_id = $1 AND activity_id = $2 AND tenant_id = $3",
        )
        .bind(proc_def_id)
        .bind(activity_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(CompensationArtifact {
                proc_def_id: row.try_get("proc_def_id")?,
                activity_id: row.try_get("activity_id")?,
                tenant_id: row.try_get("tenant_id")?,
                compensation: row.try_get("compensation")?,
                created_at: row.try_get("created_at")?,
            })),
        }
    }

    async fn upsert_compensation(&self, artifact: &CompensationArtifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mcp_python_code (proc_def_id, activity_id, tenant_id, compensation)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (proc_def_id, activity_id, tenant_id)
                DO UPDATE SET compensation = EXCLUDED.compensation
            "#,
        )
        .bind(&artifact.proc_def_id)
        .bind(&artifact.activity_id)
        .bind(&artifact.tenant_id)
        .bind(&artifact.compensation)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Chat + tenant configuration ──

    async fn upsert_chat_message(
        &self,
        room_id: &str,
        message: Value,
        tenant_id: &str,
    ) -> Result<()> {
        let mut message = message;
        if let Some(obj) = message.as_object_mut() {
            obj.entry("role").or_insert(Value::String("system".into()));
            obj.entry("timeStamp")
                .or_insert(Value::from(Utc::now().timestamp_millis()));
        }
        sqlx::query(
            "INSERT INTO chats (id, uuid, messages, tenant_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(room_id)
        .bind(Uuid::new_v4())
        .bind(&message)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fetch_tenant_mcp_config(&self, tenant_id: &str) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT value FROM configuration WHERE key = 'mcp' AND tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.and_then(|r| r.try_get::<Option<Value>, _>("value").ok().flatten()))
    }
}
