use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use rmcp::model::{
    CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
    ListPromptsResult, ListResourceTemplatesResult, ListResourcesResult, ListToolsResult,
    PaginatedRequestParam, Prompt, ReadResourceRequestParam, ReadResourceResult, Resource,
    ResourceTemplate, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};

use crate::client::UpstreamClient;
use crate::instance::InstanceCache;

const CALL_FAILURE_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Catalog enumerated from the upstream at construction time.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    pub tools: Vec<Tool>,
    pub prompts: Vec<Prompt>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
}

/// In-process MCP server fronting one upstream service.
///
/// List requests are answered from the enumerated catalog; tool calls,
/// prompt gets and resource reads are forwarded to the upstream client.
/// Cheap to clone; every downstream session shares the same state.
#[derive(Clone)]
pub struct ProxyService {
    inner: Arc<ProxyInner>,
}

struct ProxyInner {
    service_id: i64,
    name: String,
    version: String,
    cache_key: String,
    client: Arc<UpstreamClient>,
    catalog: RwLock<Catalog>,
    instances: Weak<InstanceCache>,
}

impl ProxyService {
    pub(crate) fn new(
        service_id: i64,
        name: String,
        version: String,
        cache_key: String,
        client: Arc<UpstreamClient>,
        instances: Weak<InstanceCache>,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                service_id,
                name,
                version,
                cache_key,
                client,
                catalog: RwLock::new(Catalog::default()),
                instances,
            }),
        }
    }

    pub(crate) fn set_catalog(&self, catalog: Catalog) {
        *self.inner.catalog.write().expect("catalog lock poisoned") = catalog;
    }

    pub fn catalog(&self) -> Catalog {
        self.inner
            .catalog
            .read()
            .expect("catalog lock poisoned")
            .clone()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.inner
            .catalog
            .read()
            .expect("catalog lock poisoned")
            .tools
            .clone()
    }

    /// Distinguishes a dead upstream from a client-initiated cancellation.
    ///
    /// A cancellation-shaped call failure is probed with a synchronous ping;
    /// only a failed probe evicts the shared instance, so one impatient
    /// downstream cannot tear down a healthy upstream for everyone else.
    async fn handle_call_failure(&self, error: &anyhow::Error) {
        if !is_cancellation_shaped(error) {
            return;
        }
        if self.inner.client.ping(CALL_FAILURE_PROBE_TIMEOUT).await.is_ok() {
            return;
        }

        tracing::warn!(
            service = %self.inner.name,
            error = %error,
            "upstream failed call and probe, evicting shared instance"
        );
        if let Some(instances) = self.inner.instances.upgrade() {
            instances
                .evict(self.inner.service_id, &self.inner.cache_key)
                .await;
        }
    }

    fn internal_error(&self, operation: &str, error: &anyhow::Error) -> McpError {
        McpError::internal_error(
            format!(
                "forwarding {operation} to service '{}' failed: {error:#}",
                self.inner.name
            ),
            None,
        )
    }
}

fn is_cancellation_shaped(error: &anyhow::Error) -> bool {
    let message = format!("{error:#}").to_lowercase();
    message.contains("cancelled") || message.contains("canceled")
}

impl ServerHandler for ProxyService {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(self.tools()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        match self.inner.client.call_tool(request).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.handle_call_failure(&error).await;
                Err(self.internal_error("tools/call", &error))
            }
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult::with_all_items(self.catalog().prompts))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        match self.inner.client.get_prompt(request).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.handle_call_failure(&error).await;
                Err(self.internal_error("prompts/get", &error))
            }
        }
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::with_all_items(self.catalog().resources))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        match self.inner.client.read_resource(request).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.handle_call_failure(&error).await;
                Err(self.internal_error("resources/read", &error))
            }
        }
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        Ok(ListResourceTemplatesResult::with_all_items(
            self.catalog().resource_templates,
        ))
    }

    fn get_info(&self) -> ServerInfo {
        let mut info = ServerInfo::default();
        info.server_info.name = self.inner.name.clone();
        info.server_info.version = self.inner.version.clone();
        info.capabilities = ServerCapabilities::builder()
            .enable_tools()
            .enable_prompts()
            .enable_resources()
            .build();
        info
    }
}

#[cfg(test)]
mod tests {
    use super::is_cancellation_shaped;

    #[test]
    fn cancellation_shapes_are_detected() {
        assert!(is_cancellation_shaped(&anyhow::anyhow!("request cancelled")));
        assert!(is_cancellation_shaped(&anyhow::anyhow!("context canceled")));
        assert!(!is_cancellation_shaped(&anyhow::anyhow!(
            "connection refused"
        )));
    }
}
