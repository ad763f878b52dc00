use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use media_pipeline::config::HttpConfig;
use media_pipeline::downloader::Downloader;
use media_pipeline::error::MediaError;

// A valid 1x1 transparent PNG image.
fn tiny_png() -> Vec<u8> {
    use base64::{engine::general_purpose, Engine as _};
    let base64_png = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAYAAAAfFcSJAAAADUlEQVR42mNkYPhfDwAChwGA60e6kgAAAABJRU5ErkJggg==";
    general_purpose::STANDARD.decode(base64_png).unwrap()
}

fn downloader(max_bytes: usize) -> Downloader {
    Downloader::new(&HttpConfig {
        timeout_seconds: 5,
        max_bytes,
        user_agent: "media-pipeline-tests".to_string(),
    })
    .unwrap()
}

fn parse(url: &str) -> url::Url {
    url::Url::parse(url).unwrap()
}

#[tokio::test]
async fn downloads_body_and_content_type() {
    let server = MockServer::start().await;
    let body = tiny_png();
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.clone())
                .insert_header("content-type", "image/png"),
        )
        .mount(&server)
        .await;

    let result = downloader(15_000_000)
        .download(&parse(&format!("{}/a.png", server.uri())))
        .await
        .unwrap();

    assert_eq!(result.bytes, body);
    assert_eq!(result.content_type.as_deref(), Some("image/png"));
}

#[tokio::test]
async fn non_success_status_fails_with_the_code() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    match downloader(15_000_000)
        .download(&parse(&format!("{}/gone.jpg", server.uri())))
        .await
    {
        Err(MediaError::DownloadFailed { status, .. }) => assert_eq!(status, 404),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn oversized_transfers_abort() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/big.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
        .mount(&server)
        .await;

    match downloader(1024)
        .download(&parse(&format!("{}/big.jpg", server.uri())))
        .await
    {
        Err(MediaError::DownloadTooLarge { limit }) => assert_eq!(limit, 1024),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn empty_bodies_are_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/empty.jpg"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(matches!(
        downloader(15_000_000)
            .download(&parse(&format!("{}/empty.jpg", server.uri())))
            .await,
        Err(MediaError::DownloadFailed { .. })
    ));
}

#[tokio::test]
async fn redirects_are_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.png"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("location", format!("{}/new.png", server.uri()).as_str()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/new.png"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tiny_png()))
        .mount(&server)
        .await;

    let result = downloader(15_000_000)
        .download(&parse(&format!("{}/old.png", server.uri())))
        .await
        .unwrap();
    assert_eq!(result.bytes, tiny_png());
}

#[tokio::test]
async fn non_http_schemes_are_refused() {
    assert!(matches!(
        downloader(15_000_000)
            .download(&parse("ftp://example.com/a.jpg"))
            .await,
        Err(MediaError::ValidationFailed { .. })
    ));
}
