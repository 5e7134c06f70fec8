use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use relay_config::{RuntimeOptions, ServiceRecord, ServiceType};

use super::{InstanceCache, InstanceInvalidationHook};
use crate::keys;

/// Minimal MCP server over stdio: answers initialize and the four catalog
/// lists; tools/list exposes `$FOO` so tests can observe the child env.
pub(crate) fn write_mock_server(dir: &Path) -> Result<std::path::PathBuf> {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo_tool","description":"%s","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id" "${FOO:-none}"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
    *\"prompts/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"prompts":[]}}\n' "$id"
      ;;
    *\"resources/templates/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resourceTemplates":[]}}\n' "$id"
      ;;
    *\"resources/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"resources":[]}}\n' "$id"
      ;;
  esac
done
"#,
    )?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

pub(crate) fn stdio_record(id: i64, script: &Path) -> ServiceRecord {
    ServiceRecord {
        id,
        name: format!("mock-{id}"),
        display_name: format!("Mock {id}"),
        installed_version: "0.1.0".to_string(),
        enabled: true,
        service_type: ServiceType::Stdio,
        command: "sh".to_string(),
        args_json: Some(format!("[{:?}]", script.to_string_lossy())),
        ..Default::default()
    }
}

struct RecordingHook {
    removed: Mutex<Vec<i64>>,
}

impl InstanceInvalidationHook for RecordingHook {
    fn on_instance_removed(&self, service_id: i64) {
        self.removed.lock().unwrap().push(service_id);
    }
}

#[tokio::test]
async fn stdio_instance_enumerates_catalog_and_forwards_calls() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let record = stdio_record(1, &script);
    let key = keys::shared_service_cache_key(1);

    let instance = cache
        .get_or_create(&record, &key, &keys::shared_service_instance_name(1), None)
        .await?;

    let tools = instance.tools();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name.as_ref(), "echo_tool");

    let response = instance
        .client()
        .call_tool(rmcp::model::CallToolRequestParam {
            name: "echo_tool".into(),
            arguments: None,
        })
        .await?;
    assert_eq!(
        response.content[0].as_text().map(|t| t.text.as_str()),
        Some("pong")
    );

    instance.client().ping(Duration::from_secs(5)).await?;

    cache.evict(1, &key).await;
    Ok(())
}

#[tokio::test]
async fn at_most_one_instance_per_cache_key() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let record = stdio_record(2, &script);
    let key = keys::shared_service_cache_key(2);
    let detail = keys::shared_service_instance_name(2);

    let (first, second) = tokio::join!(
        cache.get_or_create(&record, &key, &detail, None),
        cache.get_or_create(&record, &key, &detail, None),
    );
    let (first, second) = (first?, second?);

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);

    cache.evict(2, &key).await;
    Ok(())
}

#[tokio::test]
async fn env_override_replaces_record_defaults() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));

    let mut record = stdio_record(3, &script);
    record.default_envs_json = Some(r#"{"FOO":"from-record"}"#.to_string());

    let key = keys::shared_service_cache_key(3);
    let instance = cache
        .get_or_create(
            &record,
            &key,
            &keys::shared_service_instance_name(3),
            Some(r#"{"FOO":"from-override"}"#),
        )
        .await?;

    assert_eq!(
        instance.tools()[0].description.as_deref(),
        Some("from-override")
    );

    cache.evict(3, &key).await;
    Ok(())
}

#[tokio::test]
async fn record_env_applies_without_override() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));

    let mut record = stdio_record(4, &script);
    record.default_envs_json = Some(r#"{"FOO":"from-record"}"#.to_string());

    let key = keys::shared_service_cache_key(4);
    let instance = cache
        .get_or_create(&record, &key, &keys::shared_service_instance_name(4), None)
        .await?;

    assert_eq!(
        instance.tools()[0].description.as_deref(),
        Some("from-record")
    );

    cache.evict(4, &key).await;
    Ok(())
}

#[tokio::test]
async fn failed_build_leaves_cache_empty() {
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let record = ServiceRecord {
        id: 5,
        name: "missing".to_string(),
        enabled: true,
        service_type: ServiceType::Stdio,
        command: "/nonexistent/mcp-server-binary".to_string(),
        ..Default::default()
    };

    let result = cache
        .get_or_create(
            &record,
            &keys::shared_service_cache_key(5),
            &keys::shared_service_instance_name(5),
            None,
        )
        .await;

    assert!(result.is_err());
    assert!(cache.is_empty());
}

#[tokio::test]
async fn unreachable_sse_upstream_fails_construction() {
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let record = ServiceRecord {
        id: 6,
        name: "dead-sse".to_string(),
        enabled: true,
        service_type: ServiceType::Sse,
        command: "http://127.0.0.1:1/never".to_string(),
        ..Default::default()
    };

    let result = cache
        .get_or_create(
            &record,
            &keys::shared_service_cache_key(6),
            &keys::shared_service_instance_name(6),
            None,
        )
        .await;

    let error = format!("{:#}", result.unwrap_err());
    assert!(error.contains("dead-sse"), "got: {error}");
    assert!(cache.is_empty());
}

#[tokio::test]
async fn evict_notifies_hooks_and_clears_entry() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let hook = Arc::new(RecordingHook {
        removed: Mutex::new(Vec::new()),
    });
    cache.add_invalidation_hook(hook.clone());

    let record = stdio_record(7, &script);
    let key = keys::shared_service_cache_key(7);
    cache
        .get_or_create(&record, &key, &keys::shared_service_instance_name(7), None)
        .await?;

    cache.evict(7, &key).await;
    assert!(cache.get(&key).is_none());
    assert_eq!(*hook.removed.lock().unwrap(), vec![7]);

    // Idempotent: a second evict neither panics nor re-notifies.
    cache.evict(7, &key).await;
    assert_eq!(*hook.removed.lock().unwrap(), vec![7]);
    Ok(())
}

#[derive(Clone)]
struct TestUpstream;

impl rmcp::ServerHandler for TestUpstream {
    async fn list_tools(
        &self,
        _request: Option<rmcp::model::PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> std::result::Result<rmcp::model::ListToolsResult, rmcp::ErrorData> {
        Ok(rmcp::model::ListToolsResult::with_all_items(Vec::new()))
    }

    fn get_info(&self) -> rmcp::model::ServerInfo {
        let mut info = rmcp::model::ServerInfo::default();
        info.server_info.name = "test-upstream".to_string();
        info.capabilities = rmcp::model::ServerCapabilities::builder()
            .enable_tools()
            .build();
        info
    }
}

/// Serves a real streamable-HTTP upstream on a random local port and
/// returns its URL plus a kill switch for the listener task.
async fn spawn_http_upstream() -> Result<(String, tokio::task::JoinHandle<()>)> {
    use rmcp::transport::streamable_http_server::{
        StreamableHttpService, session::local::LocalSessionManager,
    };

    let service = StreamableHttpService::new(
        || Ok(TestUpstream),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let app = axum::Router::new().nest_service("/mcp", service);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/mcp"), task))
}

#[tokio::test]
async fn heartbeat_evicts_instance_when_upstream_dies() -> Result<()> {
    let (url, upstream) = spawn_http_upstream().await?;

    let options = Arc::new(RuntimeOptions::new());
    options.set(relay_config::options::OPT_HEARTBEAT_INTERVAL_SECS, "1".to_string());
    options.set(relay_config::options::OPT_HEARTBEAT_TIMEOUT_SECS, "2".to_string());
    let cache = InstanceCache::new(options);

    let record = ServiceRecord {
        id: 9,
        name: "http-upstream".to_string(),
        enabled: true,
        service_type: ServiceType::StreamableHttp,
        command: url,
        ..Default::default()
    };
    let key = keys::shared_service_cache_key(9);
    cache
        .get_or_create(&record, &key, &keys::shared_service_instance_name(9), None)
        .await?;
    assert_eq!(cache.len(), 1);

    // Kill the upstream; the next heartbeat tick must evict the instance.
    upstream.abort();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cache.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("instance evicted after upstream death");

    assert!(cache.get(&key).is_none());
    Ok(())
}

#[tokio::test]
async fn take_removes_without_shutdown() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_mock_server(temp.path())?;
    let cache = InstanceCache::new(Arc::new(RuntimeOptions::new()));
    let record = stdio_record(8, &script);
    let key = keys::shared_service_cache_key(8);

    cache
        .get_or_create(&record, &key, &keys::shared_service_instance_name(8), None)
        .await?;

    let taken = cache.take(8, &key).expect("instance present");
    assert!(cache.is_empty());

    // The client is still alive until the caller shuts it down.
    taken.client().ping(Duration::from_secs(5)).await?;
    taken.shutdown();

    assert!(cache.take(8, &key).is_none());
    Ok(())
}
