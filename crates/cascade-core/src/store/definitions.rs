//! Definition repository: versioned workflow definitions with lifecycle
//! status.

use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::definition::{DefinitionStatus, WorkflowDefinition, WorkflowEdge, WorkflowNode};
use crate::{EngineError, Result};

use super::{parse_datetime, parse_opt_json, parse_uuid, Database};

pub struct DefinitionRepository<'a> {
    db: &'a Database,
}

impl<'a> DefinitionRepository<'a> {
    pub(super) fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Persist a definition as-is (id and version included).
    pub async fn create(&self, definition: &WorkflowDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions
                (id, user_id, org_id, name, description, status, version,
                 tags, nodes, edges, input_schema, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(definition.id.to_string())
        .bind(definition.user_id.clone())
        .bind(definition.org_id.clone())
        .bind(&definition.name)
        .bind(definition.description.clone())
        .bind(status_str(definition.status))
        .bind(definition.version)
        .bind(encode(&definition.tags)?)
        .bind(encode(&definition.nodes)?)
        .bind(encode(&definition.edges)?)
        .bind(definition.input_schema.as_ref().map(encode).transpose()?)
        .bind(definition.created_at.to_rfc3339())
        .bind(definition.updated_at.to_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(definition_from_row).transpose()
    }

    /// Org-scoped read; foreign rows are indistinguishable from missing
    /// ones.
    pub async fn get_by_id_for_org(
        &self,
        id: Uuid,
        org_id: &str,
    ) -> Result<Option<WorkflowDefinition>> {
        let row = sqlx::query("SELECT * FROM workflow_definitions WHERE id = ?1 AND org_id = ?2")
            .bind(id.to_string())
            .bind(org_id)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(definition_from_row).transpose()
    }

    /// Move a definition through its lifecycle (draft → published →
    /// archived).
    pub async fn update_status(
        &self,
        id: Uuid,
        status: DefinitionStatus,
    ) -> Result<Option<WorkflowDefinition>> {
        let affected = sqlx::query(
            "UPDATE workflow_definitions SET status = ?2, updated_at = ?3 WHERE id = ?1",
        )
        .bind(id.to_string())
        .bind(status_str(status))
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    /// Replace the graph content, bumping the version. Published
    /// definitions change only through this explicit bump.
    pub async fn update_content(
        &self,
        id: Uuid,
        nodes: &[WorkflowNode],
        edges: &[WorkflowEdge],
        input_schema: Option<&Value>,
    ) -> Result<Option<WorkflowDefinition>> {
        let affected = sqlx::query(
            r#"
            UPDATE workflow_definitions SET
                nodes = ?2,
                edges = ?3,
                input_schema = ?4,
                version = version + 1,
                updated_at = ?5
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .bind(encode(&nodes)?)
        .bind(encode(&edges)?)
        .bind(input_schema.map(encode).transpose()?)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?
        .rows_affected();

        if affected == 0 {
            return Ok(None);
        }
        self.get_by_id(id).await
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<WorkflowDefinition>> {
        let rows =
            sqlx::query("SELECT * FROM workflow_definitions ORDER BY updated_at DESC LIMIT ?1")
                .bind(limit)
                .fetch_all(self.db.pool())
                .await?;
        rows.iter().map(definition_from_row).collect()
    }
}

fn status_str(status: DefinitionStatus) -> &'static str {
    match status {
        DefinitionStatus::Draft => "draft",
        DefinitionStatus::Published => "published",
        DefinitionStatus::Archived => "archived",
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| EngineError::Internal(format!("definition column not encodable: {e}")))
}

fn decode<T: serde::de::DeserializeOwned>(raw: &str, column: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| EngineError::Internal(format!("invalid {column} column: {e}")))
}

fn definition_from_row(row: &SqliteRow) -> Result<WorkflowDefinition> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let tags: String = row.try_get("tags")?;
    let nodes: String = row.try_get("nodes")?;
    let edges: String = row.try_get("edges")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    let status = match status.as_str() {
        "draft" => DefinitionStatus::Draft,
        "published" => DefinitionStatus::Published,
        "archived" => DefinitionStatus::Archived,
        other => {
            return Err(EngineError::Internal(format!(
                "unknown definition status '{other}'"
            )))
        }
    };

    Ok(WorkflowDefinition {
        id: parse_uuid(&id)?,
        user_id: row.try_get("user_id")?,
        org_id: row.try_get("org_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        status,
        version: row.try_get("version")?,
        tags: decode(&tags, "tags")?,
        nodes: decode(&nodes, "nodes")?,
        edges: decode(&edges, "edges")?,
        input_schema: parse_opt_json(row.try_get("input_schema")?)?,
        created_at: parse_datetime(&created_at)?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeKind;
    use serde_json::json;

    fn sample() -> WorkflowDefinition {
        let mut def = WorkflowDefinition::draft(
            "sample",
            vec![
                WorkflowNode::new("input", NodeKind::Input, json!({})),
                WorkflowNode::new("t1", NodeKind::Tool, json!({"toolName": "noop", "args": {}})),
            ],
            vec![WorkflowEdge::new("input", "t1")],
        );
        def.org_id = Some("org-a".into());
        def
    }

    #[tokio::test]
    async fn create_get_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let def = sample();
        db.definitions().create(&def).await.unwrap();

        let loaded = db.definitions().get_by_id(def.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "sample");
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.status, DefinitionStatus::Draft);
        assert_eq!(loaded.nodes.len(), 2);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.nodes[1].kind, NodeKind::Tool);
    }

    #[tokio::test]
    async fn org_scope_applies() {
        let db = Database::in_memory().await.unwrap();
        let def = sample();
        db.definitions().create(&def).await.unwrap();

        assert!(db
            .definitions()
            .get_by_id_for_org(def.id, "org-a")
            .await
            .unwrap()
            .is_some());
        assert!(db
            .definitions()
            .get_by_id_for_org(def.id, "org-b")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn lifecycle_and_version_bump() {
        let db = Database::in_memory().await.unwrap();
        let def = sample();
        db.definitions().create(&def).await.unwrap();

        let published = db
            .definitions()
            .update_status(def.id, DefinitionStatus::Published)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(published.status, DefinitionStatus::Published);

        let bumped = db
            .definitions()
            .update_content(def.id, &def.nodes, &def.edges, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bumped.version, 2);

        assert!(db
            .definitions()
            .update_status(Uuid::new_v4(), DefinitionStatus::Archived)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn list_is_bounded() {
        let db = Database::in_memory().await.unwrap();
        for _ in 0..3 {
            db.definitions().create(&sample()).await.unwrap();
        }
        assert_eq!(db.definitions().list(2).await.unwrap().len(), 2);
    }
}
