// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use bytes::Bytes;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::exchange::service::{ResponseMeta, Service};
use crate::icehouse_logging::warn;

pub(crate) async fn handle_exchange(
    State(service): State<Arc<Service>>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> impl IntoResponse {
    // Part streaming is synchronous and can block for a while; run it in
    // Tokio's blocking section so the server stays responsive.
    let (result, out, meta) = tokio::task::block_in_place(|| {
        let mut out = Vec::new();
        let mut meta = ResponseMeta::default();
        let result = service.process_query(&params, &body, &mut out, &mut meta);
        (result, out, meta)
    });

    match result {
        Ok(()) => build_response(meta, out),
        Err(err) => {
            warn!("part exchange request failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

fn build_response(meta: ResponseMeta, out: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(meta.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, out).into_response();
    for (name, value) in &meta.cookies {
        if let Ok(value) = header::HeaderValue::from_str(&format!("{}={}", name, value)) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    for (name, value) in &meta.headers {
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name.as_bytes()),
            header::HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::build_response;
    use crate::exchange::service::ResponseMeta;
    use axum::http::{StatusCode, header};

    #[test]
    fn build_response_carries_cookies_and_headers() {
        let meta = ResponseMeta {
            status: 429,
            reason: Some("Too many concurrent fetches, try again later".to_string()),
            cookies: vec![("server_protocol_version".to_string(), "7".to_string())],
            headers: vec![("Retry-After".to_string(), "10".to_string())],
        };
        let response = build_response(meta, Vec::new());
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response
                .headers()
                .get(header::SET_COOKIE)
                .and_then(|v| v.to_str().ok()),
            Some("server_protocol_version=7")
        );
        assert_eq!(
            response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok()),
            Some("10")
        );
    }
}
