//! Postgres implementation of [`Store`].

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use sqlx::{Postgres, QueryBuilder};

use crate::error::{Error, Result};
use crate::model::{ArtifactBuild, BuildId, BuildState, Event, EventId, NewBuild, NewEvent};
use crate::store::{BuildFilter, EventFilter, Store, Transition};
use crate::telemetry::metrics;

const EVENT_COLUMNS: &str =
    "id, message_id, search_key, event_type, released, compose_id, created_at, updated_at";

const BUILD_COLUMNS: &str = "id, event_id, name, artifact_type, state, state_reason, build_id, build_args, dep_on, rebuilt_nvr, created_at, updated_at, completed_at";

#[async_trait]
impl Store for super::Db {
    async fn get_or_create_event(&self, new: NewEvent) -> Result<Event> {
        // ON CONFLICT keeps concurrent redeliveries from creating a second row.
        let inserted: Option<EventRow> = sqlx::query_as(&format!(
            "INSERT INTO events (message_id, search_key, event_type, released)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (message_id) DO NOTHING
             RETURNING {EVENT_COLUMNS}"
        ))
        .bind(&new.message_id)
        .bind(&new.search_key)
        .bind(new.event_type.as_str())
        .bind(new.released)
        .fetch_optional(&self.pool)
        .await?;

        let row = match inserted {
            Some(row) => row,
            None => {
                sqlx::query_as(&format!(
                    "SELECT {EVENT_COLUMNS} FROM events WHERE message_id = $1"
                ))
                .bind(&new.message_id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        row.try_into_event()
    }

    async fn create_build(&self, new: NewBuild) -> Result<ArtifactBuild> {
        new.validate()?;
        let mut tx = self.pool.begin().await?;

        if let Some(parent) = new.dep_on {
            let owner: Option<(i64,)> =
                sqlx::query_as("SELECT event_id FROM artifact_builds WHERE id = $1")
                    .bind(parent.0)
                    .fetch_optional(&mut *tx)
                    .await?;
            match owner {
                Some((event_id,)) if event_id == new.event_id.0 => {}
                Some((event_id,)) => {
                    return Err(Error::ConstraintViolation(format!(
                        "dependency {parent} of {} belongs to event {event_id}, not {}",
                        new.name, new.event_id
                    )));
                }
                None => {
                    return Err(Error::ConstraintViolation(format!(
                        "dependency {parent} of {} does not exist",
                        new.name
                    )));
                }
            }
        }

        let now = Utc::now();
        let completed_at = new.state.is_terminal().then_some(now);
        let row: BuildRow = sqlx::query_as(&format!(
            "INSERT INTO artifact_builds (event_id, name, artifact_type, state, state_reason, build_id, build_args, dep_on, rebuilt_nvr, created_at, updated_at, completed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10, $11)
             RETURNING {BUILD_COLUMNS}"
        ))
        .bind(new.event_id.0)
        .bind(&new.name)
        .bind(new.artifact_type.as_str())
        .bind(new.state.to_string())
        .bind(&new.state_reason)
        .bind(new.build_id)
        .bind(serde_json::to_value(&new.build_args)?)
        .bind(new.dep_on.map(|p| p.0))
        .bind(&new.rebuilt_nvr)
        .bind(now)
        .bind(completed_at)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                Error::ConstraintViolation(db.message().to_string())
            }
            other => Error::Storage(other),
        })?;
        tx.commit().await?;

        metrics::builds_created().add(
            1,
            &[
                KeyValue::new("artifact_type", new.artifact_type.as_str()),
                KeyValue::new("state", new.state.to_string()),
            ],
        );
        row.try_into_build()
    }

    async fn mark_released(&self, id: EventId) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE events SET released = TRUE,
                 updated_at = CASE WHEN released THEN updated_at ELSE now() END
             WHERE id = $1",
        )
        .bind(id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            return Err(Error::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn find_unreleased_events_with_builds(
        &self,
        names: &BTreeSet<String>,
        exclude: EventId,
    ) -> Result<Vec<Event>> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events e
             WHERE e.released = FALSE AND e.id <> $1
               AND EXISTS (
                   SELECT 1 FROM artifact_builds b
                   WHERE b.event_id = e.id AND b.name = ANY($2)
               )
             ORDER BY e.id"
        ))
        .bind(exclude.0)
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn get_event(&self, id: EventId) -> Result<Event> {
        let row: Option<EventRow> =
            sqlx::query_as(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("event {id}")))?
            .try_into_event()
    }

    async fn get_build(&self, id: BuildId) -> Result<ArtifactBuild> {
        let row: Option<BuildRow> =
            sqlx::query_as(&format!("SELECT {BUILD_COLUMNS} FROM artifact_builds WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| Error::NotFound(format!("build {id}")))?
            .try_into_build()
    }

    async fn find_events_by_search_key(&self, search_key: &str) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE search_key = $1 ORDER BY id"
        ))
        .bind(search_key)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn find_events_by_compose_id(&self, compose_id: i64) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE compose_id = $1 ORDER BY id"
        ))
        .bind(compose_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn find_build_by_build_id(&self, build_id: i64) -> Result<Option<ArtifactBuild>> {
        let row: Option<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILD_COLUMNS} FROM artifact_builds WHERE build_id = $1
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(BuildRow::try_into_build).transpose()
    }

    async fn builds_for_event(&self, event_id: EventId) -> Result<Vec<ArtifactBuild>> {
        let rows: Vec<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILD_COLUMNS} FROM artifact_builds WHERE event_id = $1 ORDER BY id"
        ))
        .bind(event_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRow::try_into_build).collect()
    }

    async fn dependent_builds(&self, parent: BuildId) -> Result<Vec<ArtifactBuild>> {
        let rows: Vec<BuildRow> = sqlx::query_as(&format!(
            "SELECT {BUILD_COLUMNS} FROM artifact_builds WHERE dep_on = $1 ORDER BY id"
        ))
        .bind(parent.0)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(BuildRow::try_into_build).collect()
    }

    async fn set_compose_id(&self, id: EventId, compose_id: i64) -> Result<()> {
        let rows_affected =
            sqlx::query("UPDATE events SET compose_id = $1, updated_at = now() WHERE id = $2")
                .bind(compose_id)
                .bind(id.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if rows_affected == 0 {
            return Err(Error::NotFound(format!("event {id}")));
        }
        Ok(())
    }

    async fn transition_build(&self, id: BuildId, transition: Transition) -> Result<ArtifactBuild> {
        let current = self.get_build(id).await?;
        let from = current.state;
        if !from.can_transition_to(transition.to) {
            return Err(Error::InvalidTransition {
                from,
                to: transition.to,
            });
        }
        if transition.to == BuildState::Failed && transition.reason.is_none() {
            return Err(Error::ConstraintViolation(format!(
                "build {id} cannot fail without a reason"
            )));
        }

        let now = Utc::now();
        let completed_at = transition.to.is_terminal().then_some(now);

        // Optimistic: the WHERE on the old state loses against a concurrent mover.
        let rows_affected = sqlx::query(
            "UPDATE artifact_builds
             SET state = $1, state_reason = COALESCE($2, state_reason),
                 build_id = COALESCE($3, build_id), updated_at = $4,
                 completed_at = COALESCE($5, completed_at)
             WHERE id = $6 AND state = $7",
        )
        .bind(transition.to.to_string())
        .bind(&transition.reason)
        .bind(transition.build_id)
        .bind(now)
        .bind(completed_at)
        .bind(id.0)
        .bind(from.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let actual = self.get_build(id).await?.state;
            return Err(Error::InvalidTransition {
                from: actual,
                to: transition.to,
            });
        }

        metrics::build_state_transitions().add(
            1,
            &[
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", transition.to.to_string()),
            ],
        );

        self.get_build(id).await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events WHERE TRUE"));
        if let Some(event_type) = filter.event_type {
            query.push(" AND event_type = ").push_bind(event_type.as_str());
        }
        if let Some(search_key) = &filter.search_key {
            query.push(" AND search_key = ").push_bind(search_key.clone());
        }
        if let Some(released) = filter.released {
            query.push(" AND released = ").push_bind(released);
        }
        query.push(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<EventRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn list_builds(&self, filter: &BuildFilter) -> Result<Vec<ArtifactBuild>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {BUILD_COLUMNS} FROM artifact_builds WHERE TRUE"));
        if let Some(event_id) = filter.event_id {
            query.push(" AND event_id = ").push_bind(event_id.0);
        }
        if let Some(name) = &filter.name {
            query.push(" AND name = ").push_bind(name.clone());
        }
        if let Some(state) = filter.state {
            query.push(" AND state = ").push_bind(state.to_string());
        }
        if let Some(artifact_type) = filter.artifact_type {
            query.push(" AND artifact_type = ").push_bind(artifact_type.as_str());
        }
        query.push(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows: Vec<BuildRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(BuildRow::try_into_build).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: i64,
    message_id: String,
    search_key: String,
    event_type: String,
    released: bool,
    compose_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        Ok(Event {
            id: EventId(self.id),
            message_id: self.message_id,
            search_key: self.search_key,
            event_type: self.event_type.parse()?,
            released: self.released,
            compose_id: self.compose_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    event_id: i64,
    name: String,
    artifact_type: String,
    state: String,
    state_reason: Option<String>,
    build_id: Option<i64>,
    build_args: serde_json::Value,
    dep_on: Option<i64>,
    rebuilt_nvr: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl BuildRow {
    fn try_into_build(self) -> Result<ArtifactBuild> {
        Ok(ArtifactBuild {
            id: BuildId(self.id),
            event_id: EventId(self.event_id),
            name: self.name,
            artifact_type: self.artifact_type.parse()?,
            state: self.state.parse()?,
            state_reason: self.state_reason,
            build_id: self.build_id,
            build_args: serde_json::from_value(self.build_args)?,
            dep_on: self.dep_on.map(BuildId),
            rebuilt_nvr: self.rebuilt_nvr,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}
