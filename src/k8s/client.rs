// Cluster api client bootstrap shared by the watch supervisors
use crate::error::Result as OwlResult;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::{info, warn};

/// Add a custom `user-agent` header to a kube config.
///
/// An invalid header value is logged and ignored so the default user-agent is used.
pub fn add_user_agent_header(config: &mut Config, user_agent: Option<&str>) {
    let Some(user_agent) = user_agent else {
        return;
    };
    match HeaderValue::from_str(user_agent) {
        Ok(header_value) => config
            .headers
            .push((HeaderName::from_static("user-agent"), header_value)),
        Err(e) => warn!("Ignoring invalid user-agent {:?}: {}", user_agent, e),
    }
}

/// Create a new k8s client to interact with the cluster api.
///
/// The configuration is inferred the usual way: in-cluster service account
/// first, local kubeconfig otherwise.
///
/// # Errors
///
/// Will return `Err` if no configuration can be inferred or the client cannot be built
pub async fn new(custom_user_agent: Option<&str>) -> OwlResult<Client> {
    let mut config = Config::infer().await?;
    add_user_agent_header(&mut config, custom_user_agent);

    if is_running_in_cluster() {
        info!("Running in-cluster, api server {}", config.cluster_url);
    } else {
        info!("Not in-cluster, using local kubeconfig for {}", config.cluster_url);
    }

    let client = Client::try_from(config)?;
    Ok(client)
}

/// Whether the process runs inside a pod with a mounted service account
#[must_use]
pub fn is_running_in_cluster() -> bool {
    Config::incluster().is_ok()
}
