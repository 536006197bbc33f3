//! The audited exec endpoint: impersonation, auditing, and the reverse
//! proxy that carries the exec stream.
//!
//! One-shot execs are proxied straight to the upstream API over TLS. TTY
//! execs are routed through a per-session unix socket so the forwarder can
//! splice the upgraded stream through the keystroke interceptor. Both legs
//! use a hand-dialed HTTP/1 client connection, which is what lets the proxy
//! pick its own transport and bridge protocol upgrades.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::forwarder;
use crate::logging;
use crate::server::AppState;
use crate::{sys_debug, sys_error};

/// Session id recorded for execs that never allocate a TTY.
pub const ONEOFF_SESSION: &str = "oneoff";

const FORBIDDEN_BODY: &str = "no user found\n";
const INTERNAL_ERROR_BODY: &str = "internal error\n";

/// `/apis/audit.rexec.internal/v1beta1/namespaces/{namespace}/pods/{pod}/exec`
pub async fn exec_handler(
    State(state): State<AppState>,
    Path((namespace, pod)): Path<(String, String)>,
    mut req: axum::extract::Request,
) -> Response {
    let user = req
        .headers()
        .get("x-remote-user")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if user.is_empty() || namespace.is_empty() || pod.is_empty() {
        return (StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response();
    }

    let groups: Vec<HeaderValue> = req
        .headers()
        .get_all("x-remote-group")
        .iter()
        .cloned()
        .collect();

    let raw_query = req.uri().query().unwrap_or("").to_string();
    let params = match parse_query(&raw_query) {
        Ok(params) => params,
        Err(err) => {
            sys_error!(error = %err, "failed to parse exec query string");
            return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
        }
    };
    let command = initial_command(&params);
    let tty = params.iter().any(|(key, _)| key == "tty");

    // grab the inbound upgrade handle before the request is consumed
    let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
    let (parts, body) = req.into_parts();

    let native_path = format!("/api/v1/namespaces/{namespace}/pods/{pod}/exec");
    let uri = if raw_query.is_empty() {
        native_path
    } else {
        format!("{native_path}?{raw_query}")
    };

    let mut out_req = match hyper::Request::builder()
        .method(parts.method.clone())
        .uri(uri)
        .body(body)
    {
        Ok(out_req) => out_req,
        Err(err) => {
            sys_error!(error = %err, "failed to build upstream request");
            return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
        }
    };
    *out_req.headers_mut() = parts.headers;
    if let Err(err) = impersonate(&state, &user, &groups, out_req.headers_mut()) {
        sys_error!(error = %err, "failed to build impersonation headers");
        return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
    }

    if !tty {
        // no recording needed: audit the command once and pass the request
        // straight through to the upstream API
        logging::audit_command(&user, ONEOFF_SESSION, &command);
        let io = match state.upstream.connect().await {
            Ok(io) => io,
            Err(err) => {
                sys_error!(error = %err, "upstream dial failed for one-shot exec");
                return (StatusCode::BAD_GATEWAY, INTERNAL_ERROR_BODY).into_response();
            }
        };
        return proxy_through(io, out_req, client_upgrade, None).await;
    }

    let session_id = Uuid::new_v4().to_string();
    state.registry.insert(&session_id, &user);
    logging::audit_command(&user, &session_id, &command);

    let token = state.shutdown.child_token();
    tokio::spawn(forwarder::run(
        token.clone(),
        session_id.clone(),
        state.registry.clone(),
        state.upstream.clone(),
        state.strokes.clone(),
        state.config.socket_dir.clone(),
        state.config.audit_trace,
    ));

    if let Err(err) = state.registry.await_ready(&session_id).await {
        sys_error!(error = %err, session = %session_id, "waiting for session listener");
        token.cancel();
        state.registry.remove(&session_id);
        return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
    }

    let path = forwarder::socket_path(&state.config.socket_dir, &session_id);
    let io = match UnixStream::connect(&path).await {
        Ok(io) => io,
        Err(err) => {
            sys_error!(
                error = %err,
                session = %session_id,
                "failed to dial session socket"
            );
            token.cancel();
            return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
        }
    };
    proxy_through(io, out_req, client_upgrade, Some(token)).await
}

/// Attach the impersonation envelope for the upstream call.
fn impersonate(
    state: &AppState,
    user: &str,
    groups: &[HeaderValue],
    headers: &mut axum::http::HeaderMap,
) -> anyhow::Result<()> {
    headers.insert(
        header::HOST,
        HeaderValue::from_str(state.upstream.addr())?,
    );
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", state.config.token))?,
    );
    headers.insert("impersonate-user", HeaderValue::from_str(user)?);
    for group in groups {
        headers.append("impersonate-group", group.clone());
    }
    headers.insert(
        "impersonate-extra-secret-sauce",
        HeaderValue::from_str(&state.config.shared_secret)?,
    );
    headers.insert("kubectl-command", HeaderValue::from_static("kubectl exec"));
    Ok(())
}

/// Send the request over an already-dialed connection and relay the
/// response, bridging a protocol upgrade when the upstream switches.
///
/// For TTY sessions the passed token is cancelled once the exchange is
/// over, which tears the session's forwarder down.
async fn proxy_through<I>(
    io: I,
    req: hyper::Request<Body>,
    client_upgrade: Option<OnUpgrade>,
    session: Option<CancellationToken>,
) -> Response
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let guard = session.map(|token| token.drop_guard());

    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(io)).await {
        Ok(pair) => pair,
        Err(err) => {
            sys_error!(error = %err, "upstream http handshake failed");
            return (StatusCode::BAD_GATEWAY, INTERNAL_ERROR_BODY).into_response();
        }
    };
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            sys_debug!(error = %err, "proxied connection closed");
        }
    });

    let mut upstream_resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(err) => {
            sys_error!(error = %err, "proxied exec request failed");
            return (StatusCode::BAD_GATEWAY, INTERNAL_ERROR_BODY).into_response();
        }
    };

    if upstream_resp.status() == StatusCode::SWITCHING_PROTOCOLS {
        let Some(client_upgrade) = client_upgrade else {
            sys_error!("upstream switched protocols but the client cannot upgrade");
            return (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_BODY).into_response();
        };
        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);

        tokio::spawn(async move {
            // the guard keeps the session alive exactly as long as the
            // upgraded byte stream
            let _guard = guard;
            let upstream_io = match upstream_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    sys_error!(error = %err, "upstream upgrade failed");
                    return;
                }
            };
            let client_io = match client_upgrade.await {
                Ok(upgraded) => upgraded,
                Err(err) => {
                    sys_error!(error = %err, "client upgrade failed");
                    return;
                }
            };
            let mut upstream_io = TokioIo::new(upstream_io);
            let mut client_io = TokioIo::new(client_io);
            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((sent, received)) => {
                    sys_debug!(sent, received, "upgraded exec stream finished");
                }
                Err(err) => {
                    sys_debug!(error = %err, "upgraded exec stream ended");
                }
            }
        });

        let (parts, _) = upstream_resp.into_parts();
        let mut reply = Response::new(Body::empty());
        *reply.status_mut() = parts.status;
        *reply.headers_mut() = parts.headers;
        return reply;
    }

    let (parts, body) = upstream_resp.into_parts();
    let body = if guard.is_some() {
        // non-upgrade answer on the TTY path: buffer it so the forwarder
        // can be torn down as soon as this function returns
        match body.collect().await {
            Ok(collected) => Body::from(collected.to_bytes()),
            Err(err) => {
                sys_debug!(error = %err, "failed to read upstream response body");
                Body::empty()
            }
        }
    } else {
        // stream one-shot responses through unbuffered
        Body::new(body)
    };
    let mut reply = Response::new(body);
    *reply.status_mut() = parts.status;
    *reply.headers_mut() = parts.headers;
    reply
}

/// Decode the query string into ordered key/value pairs.
///
/// `form_urlencoded` decodes leniently, so malformed percent escapes are
/// checked for first to keep garbage out of the audit trail.
fn parse_query(raw_query: &str) -> anyhow::Result<Vec<(String, String)>> {
    let bytes = raw_query.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 2 >= bytes.len()
                || !bytes[i + 1].is_ascii_hexdigit()
                || !bytes[i + 2].is_ascii_hexdigit()
            {
                anyhow::bail!("malformed percent escape in query");
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    Ok(url::form_urlencoded::parse(bytes)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect())
}

/// The space-joined `command` parameters, recorded as the session's initial
/// command. Argument boundaries are not preserved.
fn initial_command(params: &[(String, String)]) -> String {
    params
        .iter()
        .filter(|(key, _)| key == "command")
        .map(|(_, value)| value.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}
