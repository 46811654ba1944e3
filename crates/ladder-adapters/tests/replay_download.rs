use ladder_adapters::{AdapterContext, ArtifactDownloader, HttpArtifactDownloader};
use ladder_storage::{ArtifactStore, BackoffPolicy, HttpClientConfig, HttpFetcher};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;

/// Answers a single request with `response` verbatim, then closes the socket.
async fn serve_once(response: Vec<u8>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut request = vec![0u8; 4096];
        let _ = socket.read(&mut request).await;
        let _ = socket.write_all(&response).await;
        let _ = socket.shutdown().await;
    });
    format!("http://{addr}/replays/7.rep")
}

fn response(status: &str, declared_len: usize, body: &[u8]) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/octet-stream\r\nContent-Length: {declared_len}\r\nConnection: close\r\n\r\n"
    )
    .into_bytes();
    out.extend_from_slice(body);
    out
}

fn downloader(root: &std::path::Path) -> (HttpArtifactDownloader, ArtifactStore) {
    let http = HttpFetcher::new(HttpClientConfig {
        backoff: BackoffPolicy::none(),
        system_proxy: false,
        ..HttpClientConfig::default()
    })
    .expect("client");
    let artifacts = ArtifactStore::new(root.join("replays"), "rep");
    (HttpArtifactDownloader::new(http, artifacts.clone()), artifacts)
}

fn entries(artifacts: &ArtifactStore, id: u64) -> Vec<String> {
    let dir = artifacts.path_for(id);
    let dir = dir.parent().expect("artifact dir");
    std::fs::read_dir(dir)
        .expect("read artifact dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn complete_body_is_stored_with_its_hash() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (downloader, artifacts) = downloader(dir.path());
    artifacts.ensure_root().await.expect("root");
    let body = b"replay payload".to_vec();
    let url = serve_once(response("200 OK", body.len(), &body)).await;

    let ctx = AdapterContext::now(Uuid::new_v4());
    let stored = downloader.download(&ctx, 7, &url).await.expect("download");

    assert_eq!(stored.file_name, "7.rep");
    assert_eq!(stored.byte_size, body.len() as u64);
    assert_eq!(stored.content_hash, hex::encode(Sha256::digest(&body)));
    assert_eq!(std::fs::read(artifacts.path_for(7)).expect("read back"), body);
}

#[tokio::test]
async fn truncated_body_leaves_no_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (downloader, artifacts) = downloader(dir.path());
    artifacts.ensure_root().await.expect("root");
    let url = serve_once(response("200 OK", 4096, b"only the first bytes")).await;

    let ctx = AdapterContext::now(Uuid::new_v4());
    assert!(downloader.download(&ctx, 7, &url).await.is_err());

    assert!(entries(&artifacts, 7).is_empty());
    assert!(artifacts.list().await.expect("list").is_empty());
}

#[tokio::test]
async fn http_error_status_writes_nothing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (downloader, artifacts) = downloader(dir.path());
    artifacts.ensure_root().await.expect("root");
    let url = serve_once(response("404 Not Found", 9, b"not found")).await;

    let ctx = AdapterContext::now(Uuid::new_v4());
    let err = downloader.download(&ctx, 7, &url).await.expect_err("404 fails");

    assert!(err.to_string().contains("404"), "{err}");
    assert!(entries(&artifacts, 7).is_empty());
}
