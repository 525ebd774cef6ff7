//! End-to-end tests for mailscribe.
//!
//! Everything runs offline or against a local HTTP stub bound to
//! 127.0.0.1, so these tests never touch the public network.

use futures::StreamExt;
use mailscribe::pipeline::dom::ParsedDocument;
use mailscribe::pipeline::{layout, threats};
use mailscribe::{
    sanitize, sanitize_batch, BatchItem, CancellationToken, FetchedBody, HttpFetcher, ImageError,
    ImageFetcher, ImageKind, PolicyName, Resolution, SanitizationPolicy, SanitizeConfig,
};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const ALL_POLICIES: [PolicyName; 3] = [
    PolicyName::Aggressive,
    PolicyName::Balanced,
    PolicyName::LayoutPreserving,
];

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs to the test harness; `RUST_LOG=mailscribe=debug`
/// shows them with `--nocapture`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn offline() -> SanitizeConfig {
    SanitizeConfig::builder().offline().build().unwrap()
}

fn png_bytes() -> Vec<u8> {
    let img = image::RgbaImage::from_pixel(3, 2, image::Rgba([200, 40, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

/// Minimal HTTP/1.1 responder. Routes:
/// - `/logo.png`   200 PNG
/// - `/hero.png`   403
/// - `/relay-c/…`  200 PNG
/// - `/relay-*/…`  500
struct Stub {
    base: String,
    hits: Arc<Mutex<Vec<String>>>,
}

async fn spawn_stub() -> Stub {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&hits);
    let png = png_bytes();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let log = Arc::clone(&log);
            let png = png.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut read = 0;
                while read < buf.len() {
                    let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    read += n;
                    if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&buf[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                log.lock().unwrap().push(path.clone());

                let (status, content_type, body) = if path == "/logo.png"
                    || path.starts_with("/relay-c/")
                {
                    ("200 OK", "image/png", png)
                } else if path == "/hero.png" {
                    ("403 Forbidden", "text/plain", b"forbidden".to_vec())
                } else if path.starts_with("/relay-") {
                    ("500 Internal Server Error", "text/plain", b"boom".to_vec())
                } else {
                    ("404 Not Found", "text/plain", Vec::new())
                };
                let head = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\n\
Content-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    Stub {
        base: format!("http://{addr}"),
        hits,
    }
}

fn stub_config(stub: &Stub) -> SanitizeConfig {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    SanitizeConfig::builder()
        .fetcher(Arc::new(HttpFetcher::with_client(client, 5 * 1024 * 1024)))
        .proxies([
            format!("{}/relay-a/?u=", stub.base),
            format!("{}/relay-b/?u=", stub.base),
            format!("{}/relay-c/?u=", stub.base),
        ])
        .probe_timeout_ms(2000)
        .proxy_timeout_ms(2000)
        .build()
        .unwrap()
}

/// Fails the test if the rendered document still carries a script, an
/// event handler or a script URL.
fn assert_safe(html: &str, context: &str) {
    let doc = ParsedDocument::parse(html);
    assert!(
        !threats::has_residual_threats(&doc),
        "[{context}] residual threat in: {html}"
    );
    let lower = html.to_ascii_lowercase();
    for needle in ["<script", "javascript:", "vbscript:", "@import", "expression("] {
        assert!(!lower.contains(needle), "[{context}] found {needle:?} in: {html}");
    }
}

// ── Safety ───────────────────────────────────────────────────────────────────

const HOSTILE: &[&str] = &[
    r#"<img src=x onerror=alert(1)>"#,
    r#"<a href="jav&#x09;ascript:alert(1)">click</a>"#,
    r#"<a href=" JAVASCRIPT:alert(1)">click</a>"#,
    r#"<svg><animate onbegin="alert(1)" attributeName="href" to="javascript:alert(1)"/></svg>"#,
    r#"<style>@import url(https://evil.test/x.css); body{color:red}</style><p>x</p>"#,
    r#"<style>p{background:u\72l(javascript:alert(1))}</style><p>x</p>"#,
    r#"<div style="background:url(javascript:alert(1));color:red">x</div>"#,
    r#"<div style="width:expression(alert(1))">x</div>"#,
    r#"<iframe src="https://evil.test"></iframe><object data="x.swf"></object><embed src="x">"#,
    r#"<form action="javascript:alert(1)"><button formaction="vbscript:x">go</button></form>"#,
    r#"<meta http-equiv="refresh" content="0;url=javascript:alert(1)"><p>x</p>"#,
    r#"<!--<script>alert(1)</script>--><p>x</p>"#,
    r#"<math><mtext><table><mglyph><style><img src=x onerror=alert(1)>"#,
    // Foreign content whose serialisation re-parses differently.
    r#"<svg></p><style><a id="</style><img src=1 onerror=alert(1)>">"#,
    r#"<svg><p><style><a title="</style><img src=x onerror=alert(1)>">"#,
    r#"<math><mtext><table><mglyph><style><a title="</style><img src=x onerror=alert(1)>">"#,
    r#"<form><math><mtext></form><form><mglyph><style></math><img src onerror=alert(1)>"#,
    r#"<svg><a title="<img src=x onerror=alert(1)>"><text>t</text></a></svg>"#,
    r#"<math><mi xlink:href="javascript:alert(1)">x</mi></math>"#,
    r#"<img src="data:text/html;base64,PHNjcmlwdD4=">"#,
    r#"<body onload="alert(1)"><p>x</p></body>"#,
    r#"<!DOCTYPE html><html><head><script>alert(1)</script></head><body onload="x()"><p>x</p></body></html>"#,
];

#[tokio::test]
async fn no_policy_lets_a_threat_through() {
    let config = offline();
    for policy in ALL_POLICIES {
        for (i, input) in HOSTILE.iter().enumerate() {
            let out = sanitize(input, policy, &config).await.unwrap();
            assert_safe(&out.html, &format!("{policy} #{i}"));
        }
    }
}

#[tokio::test]
async fn aggressive_scenario() {
    let input = r#"<div onclick="alert(1)"><img src="cid:123" width="50" height="20" alt="Logo"><script>evil()</script><p style="position:fixed">Hi</p></div>"#;
    let out = sanitize(input, PolicyName::Aggressive, &offline())
        .await
        .unwrap();

    assert!(!out.html.contains("onclick"));
    assert!(!out.html.contains("evil()"));
    assert!(!out.html.contains("position:fixed"));
    assert!(out.html.contains("<p>Hi</p>"), "got: {}", out.html);
    assert!(out.html.contains("width:50px;height:20px;line-height:20px"));
    assert!(out.html.contains(">[Logo]</span>"));

    assert_eq!(out.images.len(), 1);
    assert_eq!(out.images[0].kind, ImageKind::EmbeddedCid);
    assert_eq!(out.images[0].resolution, Resolution::Placeholder);
    assert_eq!(out.stats.removed_elements, 1);
}

// ── Images ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn every_image_is_accounted_for() {
    let input = concat!(
        r#"<img src="data:image/png;base64,iVBORw0KGgo=">"#,
        r#"<img src="/static/relative.png">"#,
        r#"<img src="cid:part1@mail">"#,
        r#"<img src="">"#,
        r#"<img src="https://cdn.example.com/a.png" alt="Banner">"#,
    );
    let out = sanitize(input, PolicyName::Balanced, &offline())
        .await
        .unwrap();

    assert_eq!(out.images.len(), 5);
    let kept = out.html.matches("<img").count();
    let placeholders = out.html.matches(r#"class="img-placeholder""#).count();
    assert_eq!(kept, 2);
    assert_eq!(placeholders, 3);
    assert_eq!(kept + placeholders, out.images.len());
    assert_eq!(out.placeholders().count(), 3);
    assert_eq!(out.stats.images_kept, 2);
    assert_eq!(out.stats.images_placeholder, 3);

    let kinds: Vec<ImageKind> = out.images.iter().map(|i| i.kind).collect();
    assert_eq!(
        kinds,
        [
            ImageKind::DataUri,
            ImageKind::Relative,
            ImageKind::EmbeddedCid,
            ImageKind::Empty,
            ImageKind::CrossOriginHttp,
        ]
    );
}

#[tokio::test]
async fn layout_preserving_placeholder_holds_exact_size() {
    let input = r#"<p>Before</p><img src="https://cdn.example.com/hero.png" width="120" height="40" alt="Hero"><p>After</p>"#;
    let out = sanitize(input, PolicyName::LayoutPreserving, &offline())
        .await
        .unwrap();
    assert!(
        out.html.contains("width:120px;height:40px;line-height:40px"),
        "got: {}",
        out.html
    );
    assert!(out.html.contains("[Hero]"));
    assert!(out.html.find("Before") < out.html.find("[Hero]"));
    assert!(out.html.find("[Hero]") < out.html.find("After"));
}

#[tokio::test]
async fn proxy_chain_over_real_http() {
    init_tracing();
    let stub = spawn_stub().await;
    let config = stub_config(&stub);
    let input = format!(r#"<img src="{}/hero.png" alt="Hero">"#, stub.base);

    let out = sanitize(&input, PolicyName::Balanced, &config).await.unwrap();

    let image = &out.images[0];
    assert_eq!(image.resolution, Resolution::Proxied);
    assert_eq!(
        image.proxy.as_deref(),
        Some(format!("{}/relay-c/?u=", stub.base).as_str())
    );
    let statuses: Vec<u16> = image
        .errors
        .iter()
        .map(|e| match e {
            ImageError::Status { status, .. } => *status,
            other => panic!("unexpected error {other:?}"),
        })
        .collect();
    assert_eq!(statuses, [403, 500, 500]);
    assert!(out.html.contains(r#"src="data:image/png;base64,"#));
    assert!(!out.html.contains("data-mailscribe-pending"));

    let hits = stub.hits.lock().unwrap().clone();
    assert_eq!(hits.len(), 4, "hits: {hits:?}");
    assert_eq!(hits[0], "/hero.png");
    assert!(hits[1].starts_with("/relay-a/?u=http%3A%2F%2F127.0.0.1"));
    assert!(hits[3].starts_with("/relay-c/"));
}

#[tokio::test]
async fn direct_probe_over_real_http_keeps_src() {
    init_tracing();
    let stub = spawn_stub().await;
    let config = stub_config(&stub);
    let src = format!("{}/logo.png", stub.base);

    let out = sanitize(&format!(r#"<img src="{src}">"#), PolicyName::LayoutPreserving, &config)
        .await
        .unwrap();

    assert_eq!(out.images[0].resolution, Resolution::Kept);
    assert!(out.images[0].errors.is_empty());
    assert!(out.html.contains(&src));
    assert_eq!(stub.hits.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn cancelled_run_degrades_to_placeholders() {
    init_tracing();
    struct NeverFetcher;

    #[async_trait::async_trait]
    impl ImageFetcher for NeverFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<FetchedBody, ImageError> {
            futures::future::pending().await
        }
    }

    let token = CancellationToken::new();
    token.cancel();
    let config = SanitizeConfig::builder()
        .fetcher(Arc::new(NeverFetcher))
        .cancellation(token)
        .build()
        .unwrap();

    let out = sanitize(
        r#"<img src="https://a.test/1.png"><img src="https://a.test/2.png">"#,
        PolicyName::Balanced,
        &config,
    )
    .await
    .unwrap();

    assert_eq!(out.placeholders().count(), 2);
    for image in &out.images {
        assert_eq!(image.errors, vec![ImageError::Cancelled]);
    }
}

// ── Shell ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn clean_complete_document_only_gains_the_head_snippet() {
    let input = "<!DOCTYPE html><html><head><title>T</title></head><body><p>Hello</p></body></html>";
    let config = offline();
    let out = sanitize(input, PolicyName::Balanced, &config).await.unwrap();

    let snippet = mailscribe::styles::head_snippet(
        &SanitizationPolicy::preset(PolicyName::Balanced),
        config.font_preload_url.as_deref(),
    );
    assert!(out.stats.passthrough);
    assert_eq!(out.html.replacen(&snippet, "", 1), input);
}

#[tokio::test]
async fn marker_lookalike_in_body_still_gets_the_head_snippet() {
    let input = r#"<!DOCTYPE html><html><head></head><body><p title="<style data-mailscribe-shell>">x</p><link rel="stylesheet" href="https://cdn.example.com/a.css"></body></html>"#;
    let config = offline();
    for policy in [PolicyName::Aggressive, PolicyName::Balanced] {
        let out = sanitize(input, policy, &config).await.unwrap();
        let snippet = mailscribe::styles::head_snippet(
            &SanitizationPolicy::preset(policy),
            config.font_preload_url.as_deref(),
        );
        assert!(out.html.contains(&format!("<head>{snippet}")), "{policy}: {}", out.html);
        assert!(out.html.contains("@font-face"));
        assert!(out.html.contains("position:static !important"));
    }
}

#[tokio::test]
async fn fragment_body_is_preserved_inside_the_shell() {
    let fragment = r#"<table width="600"><tr><td><p>Order shipped</p></td></tr></table>"#;
    let out = sanitize(fragment, PolicyName::Balanced, &offline())
        .await
        .unwrap();
    assert!(out.html.ends_with(
        "<body><table width=\"600\"><tbody><tr><td><p>Order shipped</p></td></tr></tbody></table></body></html>"
    ));
    assert!(out.html.contains("content=\"width=1200, initial-scale=1\""));
}

// ── Stage idempotence ────────────────────────────────────────────────────────

#[test]
fn strip_and_normalize_are_idempotent() {
    let input = r#"<style>.hero{position:sticky;top:0;color:#333}@media (max-width:600px){.hero{animation:pulse 1s}}</style>
<div class="hero" style="position:fixed; transform:rotate(2deg); padding:4px" onmouseover="x()">
<a href="https://shop.example.com/cart" style="background:#1a73e8;padding:12px">Buy now</a>
<a href="mailto:help@example.com">Contact</a><script>track()</script></div>"#;

    for policy in ALL_POLICIES {
        let policy = SanitizationPolicy::preset(policy);
        let doc = ParsedDocument::parse(input);
        threats::strip(&doc, &policy);
        layout::normalize(&doc, &policy);
        let once = doc.serialize().unwrap();

        let doc = ParsedDocument::parse(&once);
        let strip = threats::strip(&doc, &policy);
        let norm = layout::normalize(&doc, &policy);
        let twice = doc.serialize().unwrap();

        assert_eq!(once, twice, "{} not idempotent", policy.name);
        assert_eq!(strip, threats::StripReport::default());
        assert_eq!(norm.removed_declarations, 0);
    }
}

// ── Resource guards ──────────────────────────────────────────────────────────

#[test]
fn oversized_input_is_refused_before_parsing() {
    let config = SanitizeConfig::builder()
        .offline()
        .max_input_bytes(1024)
        .build()
        .unwrap();
    let input = "<p>".repeat(1000);
    let err = tokio_test::assert_err!(tokio_test::block_on(sanitize(
        &input,
        PolicyName::Balanced,
        &config
    )));
    assert!(matches!(
        err,
        mailscribe::SanitizeError::InputTooLarge {
            size: 3000,
            limit: 1024
        }
    ));
}

#[tokio::test]
async fn pathological_nesting_is_pruned() {
    let input = format!("{}deep{}", "<div>".repeat(600), "</div>".repeat(600));
    let out = sanitize(&input, PolicyName::Balanced, &offline())
        .await
        .unwrap();
    assert_eq!(out.stats.pruned_subtrees, 1);
    assert!(!out.html.contains("deep"));
}

// ── Batch ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn batch_mixes_html_and_plaintext() {
    let items = vec![
        BatchItem::html("a", r#"<p onclick="x()">A</p>"#),
        BatchItem::text("b", "line <one>\nline two"),
        BatchItem {
            id: "c".into(),
            html: None,
            text: None,
        },
    ];
    let mut results: Vec<_> = sanitize_batch(items, PolicyName::Balanced, &offline())
        .collect()
        .await;
    results.sort_by(|x, y| x.id.cmp(&y.id));

    assert_eq!(results.len(), 3);
    let a = results[0].output.as_ref().unwrap();
    assert!(!a.html.contains("onclick"));
    let b = results[1].output.as_ref().unwrap();
    assert!(b.html.contains("line &lt;one&gt;\nline two</pre>"), "got: {}", b.html);
    let c = results[2].output.as_ref().unwrap();
    assert!(c.html.contains("</pre>"));
}
