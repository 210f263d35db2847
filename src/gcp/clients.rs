//! The GCP client set: one entry per project, all sharing one API
//! client. Identity is the project id.
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use tracing::info;

use super::api::{Api, Project};
use crate::config::GcpConfig;
use crate::registry::Registry;

#[derive(Clone)]
pub struct Client {
    pub project_id: String,
    pub name: String,
    pub api: Arc<Api>,
}

pub type ClientSet = Registry<String, Client>;

pub static PROJECTS: Lazy<ClientSet> = Lazy::new(Registry::new);

static API: Lazy<RwLock<Option<Arc<Api>>>> = Lazy::new(|| RwLock::new(None));

/// The shared API client, once [`configure`] has run.
#[must_use]
pub fn api() -> Option<Arc<Api>> {
    API.read().expect("api lock poisoned").clone()
}

/// Builds the API client and registers one entry per project: the
/// configured list when given, otherwise every active project the
/// credentials can see. Re-running refreshes the entries in place.
pub async fn configure(cfg: &GcpConfig) -> Result<usize, super::api::Error> {
    let api = Arc::new(Api::new(cfg)?);
    *API.write().expect("api lock poisoned") = Some(Arc::clone(&api));

    let projects: Vec<Project> = if cfg.projects.is_empty() {
        discover_projects(&api).await?
    } else {
        cfg.projects
            .iter()
            .map(|project_id| Project {
                project_id: project_id.clone(),
                name: project_id.clone(),
                lifecycle_state: "ACTIVE".to_owned(),
            })
            .collect()
    };

    let mut registered = 0;
    for project in projects {
        if project.lifecycle_state != "ACTIVE" {
            continue;
        }
        PROJECTS.overwrite(
            project.project_id.clone(),
            Client {
                project_id: project.project_id.clone(),
                name: project.name,
                api: Arc::clone(&api),
            },
        );
        registered += 1;
    }
    info!(count = registered, "registered GCP projects");
    Ok(registered)
}

async fn discover_projects(api: &Api) -> Result<Vec<Project>, super::api::Error> {
    let mut projects = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = api.list_projects(token.as_deref()).await?;
        projects.extend(page.projects);
        match page.next_page_token {
            None => break,
            Some(next) if next.is_empty() => break,
            Some(next) if token.as_ref() == Some(&next) => break,
            next => token = next,
        }
    }
    Ok(projects)
}
