//! Tests for the coordinator client against a mock HTTP server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use farmhand_models::{ErrorKind, Job, JobId, RenderProcessHandle};
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::client::{ProtocolClient, CONFIG_PATH};
use crate::config::ProtocolConfig;
use crate::coordinator::{ArchiveKind, Coordinator, ErrorReport, JobRequestOutcome, KeepAliveOutcome, ServerTrouble};
use crate::host::HostInfo;
use crate::retry::RetryPolicy;

// =============================================================================
// Test Helpers
// =============================================================================

const CONFIG_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<config status="0" keepalive="900">
  <request type="request-job" path="/server/request_job.php"/>
  <request type="validate-job" path="/server/send_frame.php"/>
  <request type="keepmealive" path="/server/keepmealive.php"/>
  <request type="error" path="/server/error.php"/>
  <request type="logout" path="/account/signout.php"/>
  <request type="download-archive" path="/server/archive.php"/>
  <request type="download-binary" path="/server/binary.php"/>
</config>"#;

const JOB_XML: &str = r#"<jobrequest status="0">
  <frames remaining="12"/>
  <job id="42" archive_md5="aaaa" path="main.blend" revision="1" use_gpu="0" frame="7" extras="">
    <renderer md5="bbbb" commandline="%RENDERER% -b %SCENE% -f %FRAME%"/>
  </job>
  <file md5="old1" action="delete"/>
</jobrequest>"#;

fn test_host() -> HostInfo {
    HostInfo {
        cpu_family: "GenuineIntel".to_string(),
        cpu_model: "Test CPU".to_string(),
        cpu_cores: 8,
        total_memory_kb: 16_000_000,
        os_name: "linux".to_string(),
        arch: "x86_64".to_string(),
        hostname: "node-1".to_string(),
    }
}

fn test_config(base_url: &str) -> ProtocolConfig {
    let mut config = ProtocolConfig::new(base_url, "alice", "secret");
    config.timeout = Duration::from_secs(5);
    config.connect_timeout = Duration::from_secs(2);
    config.validation_retry = RetryPolicy::validation().with_delay(Duration::from_millis(10));
    config
}

fn test_job() -> Job {
    Job {
        id: JobId::from_string("42"),
        frame_number: 7,
        scene_md5: "aaaa".to_string(),
        renderer_md5: "bbbb".to_string(),
        path: "main.blend".to_string(),
        renderer_command: "%RENDERER% -b %SCENE% -f %FRAME%".to_string(),
        use_gpu: false,
        extras: "tile=2".to_string(),
        revision: "1".to_string(),
        name: None,
        archive_password: None,
        validation_url: None,
        output_image_path: None,
        process: RenderProcessHandle::default(),
    }
}

fn xml(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(body.to_string())
}

async fn configured_client(server: &MockServer) -> ProtocolClient {
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(xml(CONFIG_XML))
        .mount(server)
        .await;

    let client = ProtocolClient::with_host(test_config(&server.uri()), test_host()).unwrap();
    client.configure().await.unwrap();
    client
}

async fn job_outcome_for(response: ResponseTemplate) -> JobRequestOutcome {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/server/request_job.php"))
        .respond_with(response)
        .mount(&server)
        .await;
    client.request_job(&[]).await
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_configure_fills_endpoint_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .and(query_param("login", "alice"))
        .and(query_param("password", "secret"))
        .and(query_param("bits", "64bit"))
        .respond_with(xml(CONFIG_XML))
        .expect(1)
        .mount(&server)
        .await;

    let client = ProtocolClient::with_host(test_config(&server.uri()), test_host()).unwrap();
    assert_eq!(client.endpoint_path("request-job"), "");

    client.configure().await.unwrap();
    assert_eq!(client.endpoint_path("request-job"), "/server/request_job.php");
    assert_eq!(client.endpoint_path("logout"), "/account/signout.php");
    assert_eq!(client.endpoint_path("nonexistent"), "");
    assert_eq!(client.keepalive_interval(), Duration::from_secs(780));
}

#[tokio::test]
async fn test_configure_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(xml(r#"<config status="102"/>"#))
        .mount(&server)
        .await;

    let client = ProtocolClient::with_host(test_config(&server.uri()), test_host()).unwrap();
    assert_eq!(client.configure().await, Err(ErrorKind::AuthenticationFailed));
}

#[tokio::test]
async fn test_configure_unreachable_is_network_issue() {
    let client = ProtocolClient::with_host(test_config("http://127.0.0.1:1"), test_host()).unwrap();
    assert_eq!(client.configure().await, Err(ErrorKind::NetworkIssue));
}

// =============================================================================
// Job Requests
// =============================================================================

#[tokio::test]
async fn test_request_job_returns_offer() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/server/request_job.php"))
        .and(query_param("computemethod", "1"))
        .and(query_param("cpu_cores", "8"))
        .and(body_string_contains("local_files="))
        .respond_with(xml(JOB_XML))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = client.request_job(&["c1".to_string(), "c2".to_string()]).await;
    match outcome {
        JobRequestOutcome::Job(offer) => {
            assert_eq!(offer.job.id.as_str(), "42");
            assert_eq!(offer.job.frame_number, 7);
            assert_eq!(offer.frames_remaining, Some(12));
            assert_eq!(offer.evict, vec!["old1".to_string()]);
        }
        other => panic!("expected a job, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_job_classification() {
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="200"/>"#)).await,
        JobRequestOutcome::NoJob { .. }
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="201"/>"#)).await,
        JobRequestOutcome::NoRenderRight
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="202"/>"#)).await,
        JobRequestOutcome::SessionDead
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="203"/>"#)).await,
        JobRequestOutcome::SessionDisabled
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="205"/>"#)).await,
        JobRequestOutcome::RendererUnavailable
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="206"/>"#)).await,
        JobRequestOutcome::ServerTrouble(ServerTrouble::Maintenance)
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="207"/>"#)).await,
        JobRequestOutcome::ServerTrouble(ServerTrouble::Overloaded)
    ));
    assert!(matches!(
        job_outcome_for(xml(r#"<jobrequest status="999"/>"#)).await,
        JobRequestOutcome::ProtocolError(ErrorKind::Unknown)
    ));
}

#[tokio::test]
async fn test_request_job_server_trouble() {
    assert!(matches!(
        job_outcome_for(ResponseTemplate::new(503)).await,
        JobRequestOutcome::ServerTrouble(ServerTrouble::Down)
    ));
    assert!(matches!(
        job_outcome_for(xml("<html><body>Bad gateway")).await,
        JobRequestOutcome::ServerTrouble(ServerTrouble::BadResponse)
    ));
}

#[tokio::test]
async fn test_request_job_missing_field_is_protocol_error() {
    let body = JOB_XML.replace(r#"md5="bbbb" "#, "");
    assert!(matches!(
        job_outcome_for(xml(&body)).await,
        JobRequestOutcome::ProtocolError(ErrorKind::Unknown)
    ));
}

#[tokio::test]
async fn test_request_job_without_endpoint_is_configuration_failure() {
    let client = ProtocolClient::with_host(test_config("http://127.0.0.1:1"), test_host()).unwrap();
    assert!(matches!(
        client.request_job(&[]).await,
        JobRequestOutcome::ProtocolError(ErrorKind::WrongConfiguration)
    ));
}

// =============================================================================
// Validation
// =============================================================================

fn job_with_output(dir: &tempfile::TempDir) -> Job {
    let output = dir.path().join("42_7_0007.png");
    std::fs::write(&output, b"png bytes").unwrap();
    let mut job = test_job();
    job.output_image_path = Some(output);
    job.process.start(Some(100), 4);
    job.process.record_memory(2048);
    job.process.finish();
    job
}

#[tokio::test]
async fn test_validate_deletes_output_on_success() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/server/send_frame.php"))
        .and(query_param("job", "42"))
        .and(query_param("frame", "7"))
        .and(query_param("memoryused", "2048"))
        .and(query_param("cores", "4"))
        .and(query_param("extras", "tile=2"))
        .respond_with(xml(r#"<jobvalidate status="0"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let job = job_with_output(&dir);
    let output = job.output_image_path.clone().unwrap();

    client.validate_job(&job).await.unwrap();
    assert!(!output.exists());
}

#[tokio::test]
async fn test_validate_gives_up_after_three_attempts() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/server/send_frame.php"))
        .respond_with(xml(r#"<jobvalidate status="303"/>"#))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let job = job_with_output(&dir);

    assert_eq!(client.validate_job(&job).await, Err(ErrorKind::Unknown));
    assert!(job.output_image_path.unwrap().exists());
}

#[tokio::test]
async fn test_validate_session_disabled_is_terminal() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/server/send_frame.php"))
        .respond_with(xml(r#"<jobvalidate status="304"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let job = job_with_output(&dir);

    assert_eq!(client.validate_job(&job).await, Err(ErrorKind::SessionDisabled));
}

#[tokio::test]
async fn test_validate_recovers_after_transient_failure() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/server/send_frame.php"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/server/send_frame.php"))
        .respond_with(xml(r#"<jobvalidate status="0"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let job = job_with_output(&dir);
    assert!(client.validate_job(&job).await.is_ok());
}

#[tokio::test]
async fn test_validate_uses_job_validation_url() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/custom/validate"))
        .respond_with(xml(r#"<jobvalidate status="0"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut job = job_with_output(&dir);
    job.validation_url = Some(format!("{}/custom/validate", server.uri()));

    assert!(client.validate_job(&job).await.is_ok());
}

#[tokio::test]
async fn test_validate_without_output_file() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    assert_eq!(client.validate_job(&test_job()).await, Err(ErrorKind::NoOutputFile));
}

// =============================================================================
// Keepalive, Error Reports, Logout
// =============================================================================

#[tokio::test]
async fn test_keepalive_stop_rendering() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/server/keepmealive.php"))
        .and(query_param("job", "42"))
        .and(query_param("frame", "7"))
        .and(query_param("paused", "0"))
        .respond_with(xml(r#"<keepmealive status="400"/>"#))
        .mount(&server)
        .await;

    let active = test_job().active();
    let outcome = client.keep_alive(Some(&active), false).await.unwrap();
    assert_eq!(outcome, KeepAliveOutcome::StopRendering);
}

#[tokio::test]
async fn test_keepalive_continue_while_paused() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/server/keepmealive.php"))
        .and(query_param("paused", "1"))
        .respond_with(xml(r#"<keepmealive status="0"/>"#))
        .mount(&server)
        .await;

    assert_eq!(client.keep_alive(None, true).await, Ok(KeepAliveOutcome::Continue));
}

#[tokio::test(start_paused = true)]
async fn test_keepalive_due_after_idle_interval() {
    let client = ProtocolClient::with_host(test_config("http://127.0.0.1:1"), test_host()).unwrap();
    assert!(!client.keepalive_due());

    tokio::time::advance(Duration::from_secs(14 * 60)).await;
    assert!(!client.keepalive_due());

    tokio::time::advance(Duration::from_secs(2 * 60)).await;
    assert!(client.keepalive_due());
}

#[tokio::test]
async fn test_error_report_carries_code_and_job() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("POST"))
        .and(path("/server/error.php"))
        .and(query_param("type", "12"))
        .and(query_param("job", "42"))
        .and(body_string_contains("renderer segfault"))
        .respond_with(xml(r#"<error status="0"/>"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let log_file = dir.path().join("log.txt");
    std::fs::write(&log_file, "renderer segfault\n").unwrap();
    let job = test_job();

    let report = ErrorReport {
        kind: ErrorKind::RendererCrashed,
        log_file: &log_file,
        job: Some(&job),
    };
    assert!(client.send_error_report(report).await.is_ok());
}

#[tokio::test]
async fn test_logout_uses_configured_path() {
    let server = MockServer::start().await;
    let client = configured_client(&server).await;
    Mock::given(method("GET"))
        .and(path("/account/signout.php"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    assert!(client.logout().await.is_ok());
}

// =============================================================================
// Downloads
// =============================================================================

#[tokio::test]
async fn test_archive_urls() {
    let server = MockServer::start().await;
    let unconfigured = ProtocolClient::with_host(test_config(&server.uri()), test_host()).unwrap();
    assert!(unconfigured.archive_url(ArchiveKind::Scene, &test_job()).is_none());

    let client = configured_client(&server).await;
    let scene = client.archive_url(ArchiveKind::Scene, &test_job()).unwrap();
    let renderer = client.archive_url(ArchiveKind::Renderer, &test_job()).unwrap();
    assert!(scene.ends_with("/server/archive.php?job=42"));
    assert!(renderer.ends_with("/server/binary.php?job=42"));
}

#[tokio::test]
async fn test_download_streams_to_file() {
    let server = MockServer::start().await;
    let payload = vec![7u8; 64 * 1024];
    Mock::given(method("GET"))
        .and(path("/server/archive.php"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(payload.clone()))
        .mount(&server)
        .await;

    let client = configured_client(&server).await;
    let url = client.archive_url(ArchiveKind::Scene, &test_job()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("aaaa.zip");
    let seen = AtomicU64::new(0);
    let progress = |done: u64, _total: Option<u64>| {
        seen.store(done, Ordering::SeqCst);
    };

    client.download(&url, &dest, &progress).await.unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
    assert_eq!(seen.load(Ordering::SeqCst), payload.len() as u64);
}

#[tokio::test]
async fn test_call_deadline_spares_slow_downloads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(CONFIG_PATH))
        .respond_with(xml(CONFIG_XML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/server/archive.php"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![1u8; 1024])
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/server/request_job.php"))
        .respond_with(xml(JOB_XML).set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;

    let mut config = test_config(&server.uri());
    config.timeout = Duration::from_millis(500);
    let client = ProtocolClient::with_host(config, test_host()).unwrap();
    client.configure().await.unwrap();

    let url = client.archive_url(ArchiveKind::Scene, &test_job()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("aaaa.zip");
    client.download(&url, &dest, &|_: u64, _: Option<u64>| {}).await.unwrap();
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1024);

    assert!(matches!(
        client.request_job(&[]).await,
        JobRequestOutcome::ServerTrouble(ServerTrouble::Down)
    ));
}

#[tokio::test]
async fn test_download_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = ProtocolClient::with_host(test_config(&server.uri()), test_host()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let result = client
        .download("/missing.zip", &dir.path().join("x.zip"), &|_: u64, _: Option<u64>| {})
        .await;
    assert_eq!(result, Err(ErrorKind::DownloadFile));
}
