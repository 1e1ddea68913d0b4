//! Typed helpers for the control-plane resources the client works with most.
//!
//! Each helper is a thin layer over [`Client::fetch_all_pages`] or the job
//! poller, adding the lookups that raise [`Error::TaskNotFound`] and
//! [`Error::ServiceInstanceNotFound`].

use crate::{
    error::Failure,
    job::{JobLinks, JobPoll, JobResource, JobState},
    CallResult, Client, Error, Request, Response, Result,
};
use serde::{Deserialize, Serialize};

/// Order in which tasks are returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Lowest sequence id first.
    #[default]
    Ascending,
    /// Highest sequence id first.
    Descending,
}

/// A one-off task run in an application's environment.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Task {
    /// Task identifier.
    pub guid: String,
    /// Per-application sequence number, starting at 1.
    pub sequence_id: u64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Command run in the application environment.
    #[serde(default)]
    pub command: String,
    /// Lifecycle state, e.g. `RUNNING` or `SUCCEEDED`.
    #[serde(default)]
    pub state: String,
    /// Memory limit in megabytes.
    #[serde(default)]
    pub memory_in_mb: u64,
    /// Disk limit in megabytes.
    #[serde(default)]
    pub disk_in_mb: u64,
}

/// A process type of an application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Process {
    /// Process identifier.
    pub guid: String,
    /// Process type, e.g. `web` or `worker`.
    #[serde(rename = "type")]
    pub process_type: String,
    /// Desired number of instances.
    #[serde(default)]
    pub instances: u32,
    /// Memory limit per instance in megabytes.
    #[serde(default)]
    pub memory_in_mb: u64,
    /// Disk limit per instance in megabytes.
    #[serde(default)]
    pub disk_in_mb: u64,
    /// Start command, when one is set.
    #[serde(default)]
    pub command: Option<String>,
}

/// A service instance in a space.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceInstance {
    /// Service instance identifier.
    pub guid: String,
    /// Name, unique within the space.
    pub name: String,
    /// `managed` or `user-provided`.
    #[serde(rename = "type", default)]
    pub instance_type: String,
}

/// A build staging a package into a droplet.
#[derive(Debug, Clone, Deserialize)]
pub struct Build {
    /// Build identifier.
    pub guid: String,
    /// Staging state.
    pub state: JobState,
    /// Why staging failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Hypermedia links.
    #[serde(default)]
    pub links: JobLinks,
}

impl JobResource for Build {
    fn state(&self) -> JobState {
        self.state.clone()
    }

    fn failure_reason(&self) -> Option<String> {
        self.error.clone()
    }

    fn self_link(&self) -> Option<&str> {
        self.links.self_link.as_ref().map(|l| l.href.as_str())
    }
}

#[derive(Serialize)]
struct GuidRef<'a> {
    guid: &'a str,
}

#[derive(Serialize)]
struct CreateBuild<'a> {
    package: GuidRef<'a>,
}

impl Client {
    /// Lists every task of an application, sorted by sequence id.
    pub async fn get_application_tasks(&self, app_guid: &str, order: SortOrder) -> CallResult<Response<Vec<Task>>> {
        let all = self
            .fetch_all_pages::<Task>(Request::get(format!("/v3/apps/{}/tasks", app_guid)))
            .await?;

        let mut tasks = all.resources;
        match order {
            SortOrder::Ascending => tasks.sort_by_key(|t| t.sequence_id),
            SortOrder::Descending => tasks.sort_by(|a, b| b.sequence_id.cmp(&a.sequence_id)),
        }
        Ok(listing(tasks, all.warnings))
    }

    /// Looks up one task of an application by its sequence id.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::TaskNotFound`] when the application has no such task.
    pub async fn get_task_by_sequence_id(&self, app_guid: &str, sequence_id: u64) -> CallResult<Response<Task>> {
        let request = Request::get(format!("/v3/apps/{}/tasks", app_guid))
            .with_query_param("sequence_ids", sequence_id.to_string());
        let all = self.fetch_all_pages::<Task>(request).await?;

        match all.resources.into_iter().next() {
            Some(task) => Ok(listing(task, all.warnings)),
            None => Err(Failure::new(Error::TaskNotFound { sequence_id }, all.warnings)),
        }
    }

    /// Lists every process of an application.
    pub async fn get_application_processes(&self, app_guid: &str) -> CallResult<Response<Vec<Process>>> {
        let all = self
            .fetch_all_pages::<Process>(Request::get(format!("/v3/apps/{}/processes", app_guid)))
            .await?;
        Ok(listing(all.resources, all.warnings))
    }

    /// Looks up a service instance by name within a space.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::ServiceInstanceNotFound`] when the space has no
    /// instance of that name.
    pub async fn get_service_instance_by_name_and_space(
        &self,
        name: &str,
        space_guid: &str,
    ) -> CallResult<Response<ServiceInstance>> {
        let request = Request::get("/v3/service_instances")
            .with_query_param("names", name)
            .with_query_param("space_guids", space_guid);
        let all = self.fetch_all_pages::<ServiceInstance>(request).await?;

        match all.resources.into_iter().next() {
            Some(instance) => Ok(listing(instance, all.warnings)),
            None => Err(Failure::new(
                Error::ServiceInstanceNotFound {
                    name: name.to_string(),
                },
                all.warnings,
            )),
        }
    }

    /// Creates a build for a package and polls it until staging finishes.
    ///
    /// # Errors
    ///
    /// Fails only if the request body cannot be serialized; staging errors
    /// arrive through the returned poll.
    pub fn stage_package(&self, package_guid: &str) -> Result<JobPoll<Build>> {
        let request = Request::post("/v3/builds").with_json(&CreateBuild {
            package: GuidRef { guid: package_guid },
        })?;
        Ok(self.submit_job(request))
    }
}

/// Wraps an aggregate built from several calls. Per-call metadata does not
/// apply, so only the data and the warnings are meaningful.
fn listing<T>(data: T, warnings: Vec<String>) -> Response<T> {
    Response {
        data,
        warnings,
        raw_body: Default::default(),
        status: http::StatusCode::OK,
        headers: Default::default(),
        latency: Default::default(),
        attempts: 1,
    }
}
