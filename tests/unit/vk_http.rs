//! Unit tests for the VK HTTP client against a mock endpoint

use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use vk_archiver::downloader::{CallOutcome, RateLimiter, RetryPolicy};
use vk_archiver::fetcher::pagination::{PageBatch, Paginator};
use vk_archiver::fetcher::vk_http::VkHttpClient;
use vk_archiver::fetcher::{
    AttachmentMedia, Collection, Cursor, FetcherError, PageRequest, RemoteApi,
};
use vk_archiver::{Target, TargetDescriptor, TargetKind};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> VkHttpClient {
    VkHttpClient::new("test-token")
        .unwrap()
        .with_base_url(server.uri())
}

fn request(owner: Target, collection: Collection, cursor: Option<Cursor>) -> PageRequest {
    PageRequest {
        owner,
        collection,
        cursor,
        page_size: 2,
        window: None,
    }
}

fn group() -> Target {
    Target::new(TargetKind::Group, 42, "G")
}

fn api_failure(code: i64, message: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "error": {"error_code": code, "error_msg": message}
    }))
}

#[tokio::test]
async fn test_wall_page_reports_next_offset_and_total() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/wall.get"))
        .and(query_param("owner_id", "-42"))
        .and(query_param("offset", "2"))
        .and(query_param("count", "2"))
        .and(query_param("access_token", "test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "count": 5,
                "items": [{"id": 3, "date": 1}, {"id": 2, "date": 1}]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let page = client(&server)
        .list_page(&request(
            group(),
            Collection::Wall,
            Some(Cursor::Offset { offset: 2 }),
        ))
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0]["id"], 3);
    assert_eq!(page.total, Some(5));
    assert_eq!(page.next, Some(Cursor::Offset { offset: 4 }));
}

#[tokio::test]
async fn test_last_page_has_no_next_cursor() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/docs.get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {"count": 3, "items": [{"id": 3}]}
        })))
        .mount(&server)
        .await;

    let page = client(&server)
        .list_page(&request(
            group(),
            Collection::Documents,
            Some(Cursor::Offset { offset: 2 }),
        ))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.next, None);
}

#[tokio::test]
async fn test_remote_error_codes_map_onto_taxonomy() {
    let cases = [
        (6, "Too many requests per second"),
        (15, "Access denied"),
        (18, "User was deleted or banned"),
        (100, "One of the parameters specified was missing or invalid"),
    ];

    for (code, message) in cases {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/method/video.get"))
            .respond_with(api_failure(code, message))
            .mount(&server)
            .await;

        let err = client(&server)
            .list_page(&request(group(), Collection::Videos, None))
            .await
            .unwrap_err();
        match code {
            6 => assert!(matches!(err, FetcherError::RateLimitExceeded(_))),
            15 => assert!(matches!(err, FetcherError::Authorization(_))),
            18 => assert!(matches!(err, FetcherError::NotFound(_))),
            _ => assert!(matches!(err, FetcherError::Api { code: 100, .. })),
        }
        assert!(err.to_string().contains(message));
    }
}

#[tokio::test]
async fn test_http_status_maps_onto_taxonomy() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/wall.get"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/method/photos.getAlbums"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .list_page(&request(group(), Collection::Wall, None))
        .await
        .unwrap_err();
    assert!(matches!(err, FetcherError::Server { status: 502, .. }));
    assert_eq!(CallOutcome::of_error(&err), CallOutcome::TransientFailure);

    let err = client
        .list_page(&request(group(), Collection::Albums, None))
        .await
        .unwrap_err();
    assert!(matches!(err, FetcherError::RateLimitExceeded(_)));
}

#[tokio::test]
async fn test_malformed_body_is_a_parse_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/wall.get"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client(&server)
        .list_page(&request(group(), Collection::Wall, None))
        .await
        .unwrap_err();
    assert!(matches!(err, FetcherError::Parse(_)));
}

#[tokio::test]
async fn test_resolve_group_handle() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/groups.getById"))
        .and(query_param("group_id", "G"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {"groups": [{"id": 42, "name": "Group G", "screen_name": "G"}]}
        })))
        .mount(&server)
        .await;

    let target = client(&server)
        .resolve_target(&TargetDescriptor::new(TargetKind::Group, "G"))
        .await
        .unwrap();
    assert_eq!(target, Target::new(TargetKind::Group, 42, "Group G"));
    assert_eq!(target.storage_key(), "group_42");
}

#[tokio::test]
async fn test_resolve_unknown_user_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/users.get"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": []})))
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve_target(&TargetDescriptor::new(TargetKind::User, "nobody"))
        .await
        .unwrap_err();
    assert!(matches!(err, FetcherError::NotFound(_)));
}

#[tokio::test]
async fn test_attachments_unwrap_media_and_carry_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/messages.getHistoryAttachments"))
        .and(query_param("peer_id", "2000000007"))
        .and(query_param("media_type", "doc"))
        .and(query_param("start_from", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "response": {
                "items": [
                    {"message_id": 10, "attachment": {"type": "doc", "doc": {"id": 5, "title": "a.pdf"}}},
                    {"message_id": 11, "attachment": {"type": "doc", "doc": {"id": 6, "title": "b.pdf"}}}
                ],
                "next_from": "def"
            }
        })))
        .mount(&server)
        .await;

    let conversation = Target::new(TargetKind::Conversation, 7, "chat");
    let page = client(&server)
        .list_page(&request(
            conversation,
            Collection::Attachments {
                media: AttachmentMedia::Doc,
            },
            Some(Cursor::Token {
                token: "abc".into(),
            }),
        ))
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.items[0]["id"], 5);
    assert_eq!(page.items[1]["title"], "b.pdf");
    assert_eq!(
        page.next,
        Some(Cursor::Token {
            token: "def".into()
        })
    );
}

#[tokio::test]
async fn test_fetch_binary_returns_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/files/photo.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpeg bytes".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/gone.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client(&server);
    let body = client
        .fetch_binary(&format!("{}/files/photo.jpg", server.uri()))
        .await
        .unwrap();
    assert_eq!(&body[..], b"jpeg bytes");

    let err = client
        .fetch_binary(&format!("{}/files/gone.jpg", server.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, FetcherError::NotFound(_)));
}

fn stories_body() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "response": {
            "count": 2,
            "items": [
                {"owner_id": -42, "stories": [{"id": 1, "date": 1}, {"id": 2, "date": 2}]},
                {"owner_id": -42, "stories": [{"id": 3, "date": 3}, {"id": 4, "date": 4}]}
            ]
        }
    }))
}

fn stories_paginator(server: &MockServer, cursor: Option<Cursor>, cap: Option<u64>) -> Paginator {
    Paginator::new(
        Arc::new(client(server)),
        Arc::new(RateLimiter::new(1_000, 1_000.0).unwrap()),
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
        request(group(), Collection::Stories, cursor),
    )
    .with_cap(cap)
}

fn story_ids(batches: &[PageBatch]) -> Vec<i64> {
    batches
        .iter()
        .flat_map(|b| b.items.iter())
        .map(|item| item["id"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_stories_resume_skips_consumed_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/stories.get"))
        .and(query_param("owner_id", "-42"))
        .respond_with(stories_body())
        .mount(&server)
        .await;

    let page = client(&server)
        .list_page(&request(
            group(),
            Collection::Stories,
            Some(Cursor::Offset { offset: 3 }),
        ))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0]["id"], 4);
    assert_eq!(page.total, Some(4));
    assert_eq!(page.next, None);
}

#[tokio::test]
async fn test_capped_stories_continue_where_the_cap_stopped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/method/stories.get"))
        .respond_with(stories_body())
        .mount(&server)
        .await;

    let first: Vec<PageBatch> = stories_paginator(&server, None, Some(3))
        .into_stream()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(story_ids(&first), vec![1, 2, 3]);
    let resume_at = first.last().unwrap().cursor_after.clone();
    assert_eq!(resume_at, Some(Cursor::Offset { offset: 3 }));
    assert!(!first.last().unwrap().exhausted);

    let second: Vec<PageBatch> = stories_paginator(&server, resume_at, Some(3))
        .into_stream()
        .map(Result::unwrap)
        .collect()
        .await;
    assert_eq!(story_ids(&second), vec![4]);
    assert!(second.last().unwrap().exhausted);
}
