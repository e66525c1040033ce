mod common;

use std::sync::atomic::Ordering;

use bsky_publisher::{AuthScheme, Post, PostStatus, PublishFormat};
use common::{DID, FakeState, Harness, Reply};
use serde_json::json;

fn post(id: i64) -> Post {
    Post::draft(
        id,
        DID,
        "Hello",
        "<p>World with a <a href=\"https://example.com\">link</a></p>",
    )
}

#[tokio::test]
async fn publish_stores_uri_and_cid_with_one_write() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = post(1);

    let outcome = h.service.publish(&mut post).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(post.status, PostStatus::Published);
    assert_eq!(
        post.bluesky_uri.as_deref(),
        Some("at://did:plc:abc/com.whtwnd.blog.entry/xyz")
    );
    assert_eq!(post.bluesky_cid.as_deref(), Some("bafy123"));
    assert!(post.published_at.is_some());
    assert!(post.coupling_holds());
    assert_eq!(h.store.post_writes(1), 1);
    assert_eq!(h.pds.state.create_calls.load(Ordering::SeqCst), 1);

    let body = h.pds.state.last_create_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["repo"], DID);
    assert_eq!(body["collection"], "com.whtwnd.blog.entry");
    assert_eq!(body["record"]["$type"], "com.whtwnd.blog.entry");
    assert_eq!(body["record"]["title"], "Hello");
    assert_eq!(body["record"]["visibility"], "public");
    let content = body["record"]["content"].as_str().unwrap();
    assert!(content.contains("[link](https://example.com)"));
    assert!(content.ends_with("*Originally published at: http://localhost:3000/posts/1*"));
}

#[tokio::test]
async fn rejected_create_marks_post_failed() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    h.pds.state.set(
        &h.pds.state.create,
        Reply::status(400, json!({"message": "InvalidRequest"})),
    );
    let mut post = post(2);
    let content = post.content.clone();

    let outcome = h.service.publish(&mut post).await;

    assert!(!outcome.success);
    assert!(outcome.error.unwrap().contains("InvalidRequest"));
    assert!(!outcome.requires_reauth);
    assert!(!outcome.retryable);
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(post.content, content);
    assert!(post.bluesky_uri.is_none());
    assert!(post.coupling_holds());
}

#[tokio::test]
async fn failed_post_can_be_published_again() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    h.pds.state.set(&h.pds.state.create, Reply::status(502, json!({"message": "upstream"})));
    let mut post = post(3);

    let outcome = h.service.publish(&mut post).await;
    assert!(outcome.retryable);
    assert_eq!(post.status, PostStatus::Failed);

    h.pds.state.set(
        &h.pds.state.create,
        Reply::ok(json!({"uri": "at://did:plc:abc/com.whtwnd.blog.entry/retry", "cid": "bafy456"})),
    );
    let outcome = h.service.publish(&mut post).await;
    assert!(outcome.success);
    assert_eq!(post.status, PostStatus::Published);
    assert_eq!(post.bluesky_cid.as_deref(), Some("bafy456"));
}

#[tokio::test]
async fn post_with_existing_uri_is_not_created_twice() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = post(4);
    post.status = PostStatus::Failed;
    post.bluesky_uri = Some("at://did:plc:abc/com.whtwnd.blog.entry/earlier".to_string());

    let outcome = h.service.publish(&mut post).await;

    assert!(outcome.success);
    assert_eq!(post.status, PostStatus::Published);
    assert_eq!(FakeState::count(&h.pds.state.create_calls), 0);

    let again = h.service.publish(&mut post).await;
    assert!(again.success);
    assert_eq!(FakeState::count(&h.pds.state.create_calls), 0);
}

#[tokio::test]
async fn unpublish_survives_delete_timeout() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = post(5);
    assert!(h.service.publish(&mut post).await.success);

    h.pds.state.set(&h.pds.state.delete, Reply::hang());
    let outcome = h.service.unpublish(&mut post).await;

    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(post.status, PostStatus::Draft);
    assert!(post.bluesky_uri.is_none());
    assert!(post.bluesky_cid.is_none());
    assert!(post.published_at.is_none());
    assert_eq!(FakeState::count(&h.pds.state.delete_calls), 1);
}

#[tokio::test]
async fn unpublish_of_plain_draft_makes_no_calls() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = post(6);

    assert!(h.service.unpublish(&mut post).await.success);
    assert_eq!(FakeState::count(&h.pds.state.delete_calls), 0);
    assert_eq!(FakeState::count(&h.pds.state.session_checks), 0);
}

#[tokio::test]
async fn feed_post_format_carries_link_facets() {
    let h = Harness::new(PublishFormat::FeedPost, AuthScheme::Dpop).await;
    h.pds.state.set(
        &h.pds.state.create,
        Reply::ok(json!({"uri": "at://did:plc:abc/app.bsky.feed.post/3k", "cid": "bafyfeed"})),
    );
    let mut post = Post::draft(7, DID, "Title", "<p>See https://example.com/a for more</p>");

    let outcome = h.service.publish(&mut post).await;
    assert!(outcome.success, "{:?}", outcome.error);
    assert_eq!(
        post.bluesky_url("alice.test").as_deref(),
        Some("https://bsky.app/profile/alice.test/post/3k")
    );

    let body = h.pds.state.last_create_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["collection"], "app.bsky.feed.post");
    let record = &body["record"];
    let text = record["text"].as_str().unwrap();
    assert!(text.starts_with("Title\n\n"));

    let facet = &record["facets"][0];
    let start = facet["index"]["byteStart"].as_u64().unwrap() as usize;
    let end = facet["index"]["byteEnd"].as_u64().unwrap() as usize;
    assert_eq!(&text[start..end], "https://example.com/a");
    assert_eq!(facet["features"][0]["uri"], "https://example.com/a");
}

#[tokio::test]
async fn archive_and_unarchive_stay_local() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = post(8);

    h.service.archive(&mut post).await.unwrap();
    assert_eq!(post.status, PostStatus::Archived);
    assert!(h.service.archive(&mut post).await.is_err());

    h.service.unarchive(&mut post).await.unwrap();
    assert_eq!(post.status, PostStatus::Draft);

    assert_eq!(FakeState::count(&h.pds.state.session_checks), 0);
    assert_eq!(FakeState::count(&h.pds.state.create_calls), 0);
    assert_eq!(FakeState::count(&h.pds.state.delete_calls), 0);
}

#[tokio::test]
async fn empty_title_is_rejected_before_any_call() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = Post::draft(9, DID, "  ", "<p>Body</p>");

    let outcome = h.service.publish(&mut post).await;

    assert!(!outcome.success);
    assert_eq!(post.status, PostStatus::Draft);
    assert_eq!(FakeState::count(&h.pds.state.create_calls), 0);
}

#[tokio::test]
async fn publishing_without_credential_requires_reauth() {
    let h = Harness::new(PublishFormat::BlogEntry, AuthScheme::Dpop).await;
    let mut post = Post::draft(10, "did:plc:stranger", "Hi", "<p>Body</p>");

    let outcome = h.service.publish(&mut post).await;

    assert!(!outcome.success);
    assert!(outcome.requires_reauth);
    assert_eq!(post.status, PostStatus::Draft);
}
