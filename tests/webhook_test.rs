//! Integration tests for the validating admission webhook.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rexec_gateway::server::build_router;
use rexec_gateway::webhook::{
    AdmissionRequest, AdmissionReview, GroupVersionKind, UserInfo, DENIAL_MESSAGE,
};
use tower::ServiceExt;

fn webhook_router() -> axum::Router {
    common::install_crypto_provider();
    let cert = common::generate_cert();
    let config = common::test_config(&cert, "localhost:1", std::env::temp_dir());
    let (state, _strokes) = common::test_state(config);
    build_router(state)
}

fn review(kind: &str, username: &str, sauce: Option<&str>) -> AdmissionReview {
    let mut user_info = UserInfo {
        username: username.to_string(),
        ..Default::default()
    };
    if let Some(sauce) = sauce {
        user_info
            .extra
            .insert("secret-sauce".to_string(), vec![sauce.to_string()]);
    }
    AdmissionReview {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        request: Some(AdmissionRequest {
            uid: "review-uid-1".to_string(),
            kind: GroupVersionKind {
                kind: kind.to_string(),
                ..Default::default()
            },
            user_info,
        }),
        response: None,
    }
}

async fn post_review(app: axum::Router, body: Vec<u8>, content_type: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/validate-exec")
                .header("Content-Type", content_type)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

async fn decide(app: axum::Router, review: AdmissionReview) -> AdmissionReview {
    let body = serde_json::to_vec(&review).unwrap();
    let (status, body) = post_review(app, body, "application/json").await;
    assert_eq!(status, StatusCode::OK);
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn rejects_unsupported_content_type() {
    let app = webhook_router();
    let body = serde_json::to_vec(&review("PodExecOptions", "lauren", None)).unwrap();
    let (status, _) = post_review(app, body, "text/plain").await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn rejects_bad_json() {
    let app = webhook_router();
    let (status, _) = post_review(app, b"{bad-json".to_vec(), "application/json").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn allows_non_exec_kinds() {
    let app = webhook_router();
    let decided = decide(app, review("Not-PodExecOptions", "anyone", None)).await;
    let response = decided.response.unwrap();
    assert!(response.allowed);
    assert_eq!(response.uid, "review-uid-1");
    assert!(response.status.is_none());
}

#[tokio::test]
async fn allows_allowlisted_user() {
    let app = webhook_router();
    let decided = decide(app, review("PodExecOptions", "lauren", None)).await;
    assert!(decided.response.unwrap().allowed);
}

#[tokio::test]
async fn allows_matching_secret_sauce() {
    // the configured secret in the test config is "the-right-sauce"
    let app = webhook_router();
    let decided = decide(
        app,
        review("PodExecOptions", "not-lauren", Some("the-right-sauce")),
    )
    .await;
    let response = decided.response.unwrap();
    assert!(response.allowed);
    assert_eq!(response.uid, "review-uid-1");
}

#[tokio::test]
async fn denies_wrong_sauce_for_unlisted_user() {
    let app = webhook_router();
    let decided = decide(
        app,
        review("PodExecOptions", "not-lauren", Some("the-wrong-sauce")),
    )
    .await;
    let response = decided.response.unwrap();
    assert!(!response.allowed);
    assert_eq!(response.status.unwrap().message, DENIAL_MESSAGE);
}

#[tokio::test]
async fn decision_table() {
    struct Case {
        kind: &'static str,
        username: &'static str,
        sauce: Option<&'static str>,
        expect_allowed: bool,
    }
    let cases = [
        Case {
            kind: "PodExecOptions",
            username: "lauren",
            sauce: Some("the-right-sauce"),
            expect_allowed: true,
        },
        Case {
            kind: "PodExecOptions",
            username: "lauren",
            sauce: Some("the-wrong-sauce"),
            expect_allowed: true,
        },
        Case {
            kind: "PodExecOptions",
            username: "mallory",
            sauce: Some("the-right-sauce"),
            expect_allowed: true,
        },
        Case {
            kind: "PodExecOptions",
            username: "mallory",
            sauce: Some("the-wrong-sauce"),
            expect_allowed: false,
        },
        Case {
            kind: "PodExecOptions",
            username: "mallory",
            sauce: None,
            expect_allowed: false,
        },
        Case {
            kind: "Pod",
            username: "mallory",
            sauce: None,
            expect_allowed: true,
        },
        Case {
            kind: "Pod",
            username: "lauren",
            sauce: Some("the-right-sauce"),
            expect_allowed: true,
        },
    ];

    for case in cases {
        let app = webhook_router();
        let decided = decide(app, review(case.kind, case.username, case.sauce)).await;
        let response = decided.response.unwrap();
        assert_eq!(
            response.allowed, case.expect_allowed,
            "kind={} user={} sauce={:?}",
            case.kind, case.username, case.sauce
        );
    }
}
