use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, ClientCapabilities, GetPromptRequestParam,
    GetPromptResult, Implementation, InitializeRequestParam, PaginatedRequestParam, Prompt,
    ReadResourceRequestParam, ReadResourceResult, Resource, ResourceTemplate, Tool,
};
use rmcp::service::{RunningService, ServiceExt};
use rmcp::transport::streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
use rmcp::transport::{ConfigureCommandExt, child_process::TokioChildProcess, sse_client};
use rmcp::RoleClient;
use tokio::process::Command;

use relay_config::{ServiceRecord, ServiceType};

/// One live MCP client session against an upstream server.
///
/// Construction performs the transport connect and the MCP initialize
/// handshake; a failed handshake never yields a half-open client. All
/// catalog enumeration follows the MCP cursor convention.
pub struct UpstreamClient {
    runtime: RunningService<RoleClient, InitializeRequestParam>,
}

impl UpstreamClient {
    /// Connects to the upstream described by `record`.
    ///
    /// For stdio the child inherits the process environment plus the decoded
    /// env pairs; for the HTTP transports the decoded headers ride on every
    /// request via the underlying reqwest client.
    pub async fn connect(record: &ServiceRecord, instance_name_detail: &str) -> Result<Self> {
        let client_info = proxy_client_info(&record.name, instance_name_detail);
        let describe = || {
            format!(
                "service '{}' ({}, {})",
                record.name, record.service_type, instance_name_detail
            )
        };

        let runtime = match record.service_type {
            ServiceType::Stdio => {
                let args = record.decoded_args();
                let envs = record.decoded_envs();
                let transport = TokioChildProcess::new(
                    Command::new(&record.command).configure(|cmd| {
                        cmd.args(&args);
                        cmd.envs(&envs);
                        cmd.stdin(std::process::Stdio::piped());
                        cmd.stdout(std::process::Stdio::piped());
                        cmd.stderr(std::process::Stdio::null());
                        cmd.kill_on_drop(true);
                    }),
                )
                .with_context(|| format!("failed to spawn {}", describe()))?;

                client_info
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to initialize {}", describe()))?
            }
            ServiceType::Sse => {
                let http = http_client(&record.decoded_headers())
                    .with_context(|| format!("failed to build HTTP client for {}", describe()))?;
                let transport = sse_client::SseClientTransport::start_with_client(
                    http,
                    sse_client::SseClientConfig {
                        sse_endpoint: record.command.clone().into(),
                        ..Default::default()
                    },
                )
                .await
                .with_context(|| format!("failed to start {}", describe()))?;

                client_info
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to initialize {}", describe()))?
            }
            ServiceType::StreamableHttp => {
                let http = http_client(&record.decoded_headers())
                    .with_context(|| format!("failed to build HTTP client for {}", describe()))?;
                let transport = StreamableHttpClientTransport::with_client(
                    http,
                    StreamableHttpClientTransportConfig::with_uri(record.command.clone()),
                );

                client_info
                    .serve(transport)
                    .await
                    .with_context(|| format!("failed to initialize {}", describe()))?
            }
        };

        Ok(Self { runtime })
    }

    /// Enumerates all tools, following cursors until exhausted.
    pub async fn list_tools_all(&self) -> Result<Vec<Tool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .runtime
                .peer()
                .list_tools(page_param(cursor.take()))
                .await
                .context("tools/list failed")?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Enumerates all prompts, following cursors until exhausted.
    pub async fn list_prompts_all(&self) -> Result<Vec<Prompt>> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .runtime
                .peer()
                .list_prompts(page_param(cursor.take()))
                .await
                .context("prompts/list failed")?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(prompts)
    }

    /// Enumerates all resources, following cursors until exhausted.
    pub async fn list_resources_all(&self) -> Result<Vec<Resource>> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .runtime
                .peer()
                .list_resources(page_param(cursor.take()))
                .await
                .context("resources/list failed")?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    /// Enumerates all resource templates, following cursors until exhausted.
    pub async fn list_resource_templates_all(&self) -> Result<Vec<ResourceTemplate>> {
        let mut templates = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .runtime
                .peer()
                .list_resource_templates(page_param(cursor.take()))
                .await
                .context("resources/templates/list failed")?;
            templates.extend(page.resource_templates);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(templates)
    }

    pub async fn call_tool(&self, request: CallToolRequestParam) -> Result<CallToolResult> {
        self.runtime
            .peer()
            .call_tool(request)
            .await
            .context("tools/call failed")
    }

    pub async fn get_prompt(&self, request: GetPromptRequestParam) -> Result<GetPromptResult> {
        self.runtime
            .peer()
            .get_prompt(request)
            .await
            .context("prompts/get failed")
    }

    pub async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
    ) -> Result<ReadResourceResult> {
        self.runtime
            .peer()
            .read_resource(request)
            .await
            .context("resources/read failed")
    }

    /// Liveness probe with a deadline.
    ///
    /// The client peer has no dedicated ping RPC, so the probe is a one-page
    /// tools/list round-trip: cheap, and it fails exactly when the session
    /// is dead.
    pub async fn ping(&self, deadline: Duration) -> Result<()> {
        match tokio::time::timeout(deadline, self.runtime.peer().list_tools(None)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(error)) => Err(anyhow!(error)),
            Err(_) => Err(anyhow!("ping timed out after {}ms", deadline.as_millis())),
        }
    }

    /// Implementation info the upstream reported during initialize.
    pub fn server_info(&self) -> Option<Implementation> {
        self.runtime
            .peer()
            .peer_info()
            .map(|info| info.server_info.clone())
    }

    /// Signals the client runtime to shut down. Non-blocking; the transport
    /// task exits on its own cancellation.
    pub fn close(&self) {
        self.runtime.cancellation_token().cancel();
    }
}

fn page_param(cursor: Option<String>) -> Option<PaginatedRequestParam> {
    cursor.map(|cursor| PaginatedRequestParam::default().with_cursor(Some(cursor)))
}

fn proxy_client_info(service_name: &str, instance_name_detail: &str) -> InitializeRequestParam {
    InitializeRequestParam::new(
        ClientCapabilities::default(),
        Implementation::new(
            format!("mcp-proxy-for-{service_name}-{instance_name_detail}"),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    )
}

fn http_client(headers: &HashMap<String, String>) -> Result<reqwest::Client> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for '{name}'"))?;
        map.insert(header_name, header_value);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .context("failed to build reqwest client")
}
