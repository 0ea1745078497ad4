use std::time::SystemTime;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tiny_http::{Header, Method, Response, Server};

use crate::{
    error::AppError,
    fiat::{FiatSandbox, KycStartRequest, OnrampStartRequest, QuoteRequest},
};

pub const DEFAULT_FIAT_BIND: &str = "127.0.0.1:8000";

#[derive(Debug, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    fn ok(body: impl serde::Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Reply { status: 200, body },
            Err(e) => Reply { status: 500, body: json!({ "detail": e.to_string() }) },
        }
    }

    fn detail(status: u16, detail: &str) -> Self {
        Reply { status, body: json!({ "detail": detail }) }
    }
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, Reply> {
    serde_json::from_str(body).map_err(|e| Reply::detail(422, &e.to_string()))
}

/// パーセントエンコードを解いたクエリ値
fn query_param(url: &str, name: &str) -> Option<String> {
    let parsed = Url::parse("http://localhost").ok()?.join(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key.as_ref() == name)
        .map(|(_, value)| value.into_owned())
}

/// メソッドとパスで振り分ける。ソケットに依存しない
pub fn route(sandbox: &mut FiatSandbox, method: &Method, url: &str, body: &str, now: SystemTime) -> Reply {
    let path = url.split_once('?').map_or(url, |(path, _)| path);
    let result = match (method, path) {
        (Method::Options, _) => Ok(Reply { status: 200, body: Value::Null }),
        (Method::Post, "/kyc/start") => {
            parse_body::<KycStartRequest>(body).map(|req| Reply::ok(sandbox.kyc_start(&req, now)))
        }
        (Method::Get, "/kyc/status") => match query_param(url, "user_id") {
            Some(user_id) => Ok(Reply::ok(sandbox.kyc_status(&user_id, now))),
            None => Err(Reply::detail(422, "user_id is required")),
        },
        (Method::Post, "/fiat/onramp/quote") => {
            parse_body::<QuoteRequest>(body).map(|req| Reply::ok(sandbox.quote(&req)))
        }
        (Method::Post, "/fiat/onramp/start") => {
            parse_body::<OnrampStartRequest>(body).map(|req| Reply::ok(sandbox.onramp_start(&req, now)))
        }
        // 署名検証はしない
        (Method::Post, "/webhooks/partner") => Ok(Reply::ok(json!({ "ok": true }))),
        (_, "/kyc/start" | "/kyc/status" | "/fiat/onramp/quote" | "/fiat/onramp/start" | "/webhooks/partner") => {
            Err(Reply::detail(405, "Method Not Allowed"))
        }
        _ => Err(Reply::detail(404, "Not Found")),
    };
    result.unwrap_or_else(|reply| reply)
}

fn header(name: &str, value: &str) -> Result<Header, AppError> {
    Header::from_bytes(name.as_bytes(), value.as_bytes())
        .map_err(|_| AppError::Internal(format!("不正なヘッダ: {}: {}", name, value)))
}

/// ブロッキングで待ち受ける。状態はプロセス内のみ
pub fn serve(bind: &str) -> Result<(), AppError> {
    let server = Server::http(bind).map_err(|e| AppError::network("フィアットサーバの起動に失敗しました", e))?;
    log::info!("フィアット・サンドボックスを起動しました: http://{}", bind);

    let headers = [
        header("Content-Type", "application/json")?,
        header("Access-Control-Allow-Origin", "*")?,
        header("Access-Control-Allow-Methods", "*")?,
        header("Access-Control-Allow-Headers", "*")?,
    ];
    let mut sandbox = FiatSandbox::new();

    for mut request in server.incoming_requests() {
        let mut body = String::new();
        let reply = match request.as_reader().read_to_string(&mut body) {
            Ok(_) => route(&mut sandbox, request.method(), request.url(), &body, SystemTime::now()),
            Err(e) => Reply::detail(400, &e.to_string()),
        };
        log::debug!("{} {} -> {}", request.method(), request.url(), reply.status);

        let mut response = Response::from_string(reply.body.to_string()).with_status_code(reply.status);
        for h in &headers {
            response.add_header(h.clone());
        }
        if let Err(e) = request.respond(response) {
            log::warn!("応答の送信に失敗しました: {}", e);
        }
    }
    Ok(())
}
