//! Project collector. Projects come first in `collect-all`: every other
//! GCP collector fans out across the project client set, and the table
//! seeds the project link functions.
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu};
use sqlx::{PgPool, QueryBuilder};
use tracing::info;

use crate::gcp::{api, clients};
use crate::metrics::{self, Descriptor};
use crate::models::gcp::Project;
use crate::queue::{ActiveTask, Context, TaskError};

pub const TASK_KIND: &str = "gcp:collect-projects";

pub(crate) const METRIC: Descriptor = Descriptor {
    task_kind: TASK_KIND,
    name: "gcp_projects",
    help: "Number of collected GCP projects.",
    labels: &["state"],
};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no GCP API client configured"))]
    NoApiClient,

    #[snafu(display("failed to list projects: {}", source))]
    ListProjects { source: api::Error },

    #[snafu(display("failed to upsert projects: {}", source))]
    Upsert { source: sqlx::Error },
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        let permanent = match &err {
            Error::NoApiClient => true,
            Error::ListProjects { source } => api::is_permanent(source),
            Error::Upsert { .. } => false,
        };
        if permanent {
            TaskError::skip_retry(err)
        } else {
            TaskError::failed(err)
        }
    }
}

pub(crate) async fn handle(ctx: Arc<Context>, _task: ActiveTask) -> Result<(), TaskError> {
    collect(&ctx).await.map_err(Into::into)
}

async fn collect(ctx: &Context) -> Result<(), Error> {
    let api = clients::api().context(NoApiClient)?;

    let mut projects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = api
            .list_projects(token.as_deref())
            .await
            .context(ListProjects)?;
        projects.extend(page.projects);
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }

    let rows: Vec<Project> = projects.iter().map(map_project).collect();
    let count = persist(&ctx.db, &rows).await.context(Upsert)?;
    #[allow(clippy::cast_precision_loss)]
    metrics::add_metric(TASK_KIND, &["ACTIVE"], count as f64);
    info!(count, "collected GCP projects");
    Ok(())
}

fn map_project(project: &api::Project) -> Project {
    Project {
        project_id: project.project_id.clone(),
        name: project.name.clone(),
        state: project.lifecycle_state.clone(),
    }
}

async fn persist(db: &PgPool, rows: &[Project]) -> Result<u64, sqlx::Error> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut query =
        QueryBuilder::<sqlx::Postgres>::new("INSERT INTO gcp_projects (project_id, name, state) ");
    query.push_values(rows, |mut row_builder, row| {
        row_builder
            .push_bind(&row.project_id)
            .push_bind(&row.name)
            .push_bind(&row.state);
    });
    query.push(
        " ON CONFLICT (project_id) DO UPDATE SET \
         name = EXCLUDED.name, \
         state = EXCLUDED.state, \
         updated_at = EXCLUDED.updated_at",
    );
    Ok(query.build().execute(db).await?.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_copies_identity_fields() {
        let project = api::Project {
            project_id: "inventory-dev".to_owned(),
            name: "Inventory Dev".to_owned(),
            lifecycle_state: "ACTIVE".to_owned(),
        };
        let row = map_project(&project);
        assert_eq!(row.project_id, "inventory-dev");
        assert_eq!(row.name, "Inventory Dev");
        assert_eq!(row.state, "ACTIVE");
    }
}
