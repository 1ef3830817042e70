//! End-to-end cache sharing, cache bypass, temp-ban gating, and the
//! reserved endpoints.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use support::{error_body, ok_body, start_proxy, timestamp_in, UpstreamFn};

#[tokio::test]
async fn repeated_requests_share_one_upstream_fetch() {
    let handler: Arc<UpstreamFn> = Arc::new(|_path, _params| {
        (
            200,
            ok_body("2030-01-01 00:00:00", "<result>alpha</result>"),
        )
    });
    let proxy = start_proxy(handler, 3).await;

    let (status_a, body_a) = proxy.get("/eve/characterid.xml.aspx?names=CCP").await;
    let (status_b, body_b) = proxy.get("/eve/characterid.xml.aspx?names=CCP").await;

    assert_eq!(status_a, 200);
    assert_eq!(status_b, 200);
    assert_eq!(body_a, body_b);
    assert_eq!(proxy.hits(), 1);
}

#[tokio::test]
async fn force_bypasses_the_cache_read_and_overwrites_the_entry() {
    let serial = Arc::new(AtomicUsize::new(0));
    let handler: Arc<UpstreamFn> = {
        let serial = serial.clone();
        Arc::new(move |_path, _params| {
            let n = serial.fetch_add(1, Ordering::SeqCst) + 1;
            (
                200,
                ok_body(&timestamp_in(3600), &format!("<serial>{n}</serial>")),
            )
        })
    };
    let proxy = start_proxy(handler, 3).await;

    let (_, first) = proxy.get("/eve/characterid.xml.aspx?names=CCP").await;
    assert!(first.contains("<serial>1</serial>"));
    assert_eq!(proxy.hits(), 1);

    let (_, forced) = proxy
        .get("/eve/characterid.xml.aspx?names=CCP&force=1")
        .await;
    assert!(forced.contains("<serial>2</serial>"));
    assert_eq!(proxy.hits(), 2);

    // The forced fetch replaced the cached entry.
    let (_, cached) = proxy.get("/eve/characterid.xml.aspx?names=CCP").await;
    assert!(cached.contains("<serial>2</serial>"));
    assert_eq!(proxy.hits(), 2);
}

#[tokio::test]
async fn nocache_requests_neither_read_nor_write_the_cache() {
    let serial = Arc::new(AtomicUsize::new(0));
    let handler: Arc<UpstreamFn> = {
        let serial = serial.clone();
        Arc::new(move |_path, _params| {
            let n = serial.fetch_add(1, Ordering::SeqCst) + 1;
            (
                200,
                ok_body(&timestamp_in(3600), &format!("<serial>{n}</serial>")),
            )
        })
    };
    let proxy = start_proxy(handler, 3).await;

    let (_, first) = proxy
        .get("/eve/characterid.xml.aspx?names=CCP&nocache=1")
        .await;
    let (_, second) = proxy
        .get("/eve/characterid.xml.aspx?names=CCP&nocache=1")
        .await;

    assert!(first.contains("<serial>1</serial>"));
    assert!(second.contains("<serial>2</serial>"));
    assert_eq!(proxy.hits(), 2);
}

#[tokio::test]
async fn unknown_pages_get_a_synthetic_404() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body(&timestamp_in(3600), "<r/>")));
    let proxy = start_proxy(handler, 3).await;

    let (status, body) = proxy.get("/not/a/real/page.xml.aspx").await;
    assert_eq!(status, 404);
    assert!(body.contains("error code=\"404\""));
    assert!(body.contains("Invalid API page."));
    assert_eq!(proxy.hits(), 0);
}

#[tokio::test]
async fn paths_are_cleaned_and_matched_case_insensitively() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body(&timestamp_in(3600), "<r/>")));
    let proxy = start_proxy(handler, 3).await;

    let (status, _) = proxy.get("/Eve/CharacterID.xml.aspx/?names=CCP").await;
    assert_eq!(status, 200);

    let (status, _) = proxy
        .get("/char//skills.xml.aspx?keyid=1&vcode=abc")
        .await;
    assert_eq!(status, 200);
}

#[tokio::test]
async fn upstream_ban_code_short_circuits_everything_else() {
    let handler: Arc<UpstreamFn> = Arc::new(|path, _params| {
        if path == "/eve/alliancelist.xml.aspx" {
            (200, error_body(904, "banned", &timestamp_in(60)))
        } else {
            (200, ok_body(&timestamp_in(3600), "<r/>"))
        }
    });
    let proxy = start_proxy(handler, 3).await;

    // The ban response itself is passed through with the upstream status.
    let (status, body) = proxy.get("/eve/alliancelist.xml.aspx").await;
    assert_eq!(status, 200);
    assert!(body.contains("error code=\"904\""));
    assert_eq!(proxy.hits(), 1);

    // Every following request is answered synthetically without a POST.
    for i in 0..20 {
        let (status, body) = proxy
            .get(&format!("/eve/characterid.xml.aspx?names=pilot{i}"))
            .await;
        assert_eq!(status, 418, "request {i} should be gated");
        assert!(body.contains("error code=\"904\""));
    }
    assert_eq!(proxy.hits(), 1);

    // Identical repeats hit the cached synthetic entry.
    let (status, _) = proxy.get("/eve/characterid.xml.aspx?names=pilot0").await;
    assert_eq!(status, 418);
    assert_eq!(proxy.hits(), 1);

    let (until, code) = proxy.state.client.panic_snapshot().expect("active panic");
    assert_eq!(code, 904);
    assert!(until > chrono::Utc::now());
}

#[tokio::test]
async fn stats_page_reports_counters() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body(&timestamp_in(3600), "<r/>")));
    let proxy = start_proxy(handler, 3).await;

    proxy.get("/server/serverstatus.xml.aspx").await;

    let (status, body) = proxy.get("/stats").await;
    assert_eq!(status, 200);
    assert!(body.contains("workers:"));
    assert!(body.contains("cache:"));
    assert!(body.contains("limits:"));
    assert!(body.contains("panic: clear"));
}

#[tokio::test]
async fn logon_and_logoff_adjust_verbosity() {
    let handler: Arc<UpstreamFn> =
        Arc::new(|_path, _params| (200, ok_body(&timestamp_in(3600), "<r/>")));
    let proxy = start_proxy(handler, 3).await;

    let (status, _) = proxy.get("/logon").await;
    assert_eq!(status, 200);
    let (status, _) = proxy.get("/logoff").await;
    assert_eq!(status, 200);
}
