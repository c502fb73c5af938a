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
use std::net::TcpListener;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::post;

use crate::exchange::service::Service;
use crate::icehouse_logging::info;
use crate::service::exchange_http;

pub fn router(service: Arc<Service>) -> Router {
    Router::new()
        .route("/", post(exchange_http::handle_exchange))
        .with_state(service)
}

/// Serve the part exchange on an already-bound listener. Binding first lets
/// callers (and tests) pick port 0 and learn the real address.
pub async fn serve(listener: TcpListener, service: Arc<Service>) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("set listener non-blocking")?;
    let local_addr = listener.local_addr().context("listener local addr")?;
    info!("part exchange server listening on {}", local_addr);
    let listener =
        tokio::net::TcpListener::from_std(listener).context("wrap listener for tokio")?;
    axum::serve(listener, router(service))
        .await
        .context("serve part exchange")?;
    Ok(())
}

pub async fn start_exchange_server(host: &str, port: u16, service: Arc<Service>) -> Result<()> {
    let listener =
        TcpListener::bind((host, port)).with_context(|| format!("bind {}:{}", host, port))?;
    serve(listener, service).await
}
