//! Upstream client behavior that is easiest to observe at the library level:
//! expiry floors, the invalidate bit, and synthetic failure bodies.

mod support;

use apiproxy::apicache::ApiRequest;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use support::{error_body, ok_body, start_proxy, timestamp_in, UpstreamFn};

#[tokio::test]
async fn expires_floor_raises_but_never_lowers_the_expiry() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body(&timestamp_in(60), "<r/>")));
    let proxy = start_proxy(handler, 3).await;
    let client = &proxy.state.client;

    let mut raised = ApiRequest::new("eve/typename.xml.aspx");
    raised.set("ids", "1");
    raised.no_cache = true;
    let floor = Utc::now() + ChronoDuration::hours(1);
    raised.expires_floor = Some(floor);
    let resp = client.execute(&raised).await;
    assert_eq!(resp.expires, floor);
    assert!(!resp.from_cache);

    let mut kept = ApiRequest::new("eve/typename.xml.aspx");
    kept.set("ids", "2");
    kept.no_cache = true;
    kept.expires_floor = Some(Utc::now() - ChronoDuration::hours(1));
    let resp = client.execute(&kept).await;
    // The parsed cachedUntil (one minute out) wins over a lower floor.
    assert!(resp.expires > Utc::now());
    assert!(resp.expires <= Utc::now() + ChronoDuration::minutes(2));
}

#[tokio::test]
async fn invalidate_follows_status_and_error_code() {
    let handler: Arc<UpstreamFn> = Arc::new(|path, _params| match path {
        "/forbidden" => (403, ok_body(&timestamp_in(60), "<r/>")),
        "/autherr" => (
            200,
            error_body(203, "Authentication failure", &timestamp_in(60)),
        ),
        _ => (200, ok_body(&timestamp_in(60), "<r/>")),
    });
    let proxy = start_proxy(handler, 3).await;
    let client = &proxy.state.client;

    let mut req = ApiRequest::new("forbidden");
    req.no_cache = true;
    let resp = client.execute(&req).await;
    assert_eq!(resp.status, 403);
    assert!(resp.invalidate);

    let mut req = ApiRequest::new("autherr");
    req.no_cache = true;
    let resp = client.execute(&req).await;
    assert_eq!(resp.error.code, 203);
    assert!(resp.invalidate);

    let mut req = ApiRequest::new("clean");
    req.no_cache = true;
    let resp = client.execute(&req).await;
    assert!(!resp.invalidate);
}

#[tokio::test]
async fn malformed_bodies_become_cacheable_proxy_errors() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, "<eveapi><unclosed".to_string()));
    let proxy = start_proxy(handler, 3).await;
    let client = &proxy.state.client;

    let req = ApiRequest::new("eve/typename.xml.aspx");
    let resp = client.execute(&req).await;
    assert_eq!(resp.status, 504);
    assert!(!resp.from_cache);
    assert!(String::from_utf8_lossy(&resp.body).contains("error code=\"500\""));
    assert_eq!(proxy.hits(), 1);

    // The synthetic body was stored, so the retry is served locally.
    let resp = client.execute(&req).await;
    assert!(resp.from_cache);
    assert_eq!(resp.status, 504);
    assert_eq!(proxy.hits(), 1);
}

#[tokio::test]
async fn bad_cache_directives_are_proxy_errors() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body("soon", "<r/>")));
    let proxy = start_proxy(handler, 3).await;
    let client = &proxy.state.client;

    let mut req = ApiRequest::new("eve/typename.xml.aspx");
    req.no_cache = true;
    let resp = client.execute(&req).await;
    assert_eq!(resp.status, 504);
    assert!(String::from_utf8_lossy(&resp.body).contains("error code=\"500\""));
}
