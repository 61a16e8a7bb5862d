// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::RecoveryError;

/// Repeatedly runs `f` every `interval` until it yields a value, giving up
/// after `timeout`.
///
/// `Ok(None)` means "not yet". Errors are treated the same way: they are
/// logged and the operation is attempted again on the next tick, since the
/// things being polled (pods, agents, SQL connections) are expected to fail
/// while members restart.
pub async fn poll_until<T, E, F, U>(
    what: &str,
    interval: Duration,
    timeout: Duration,
    mut f: F,
) -> Result<T, RecoveryError>
where
    E: Display,
    F: FnMut() -> U,
    U: Future<Output = Result<Option<T>, E>>,
{
    let attempts = async {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(Some(value)) => return value,
                Ok(None) => debug!(%what, attempt, "not ready"),
                Err(err) => debug!(%what, attempt, "attempt failed: {err}"),
            }
            tokio::time::sleep(interval).await;
        }
    };
    tokio::time::timeout(timeout, attempts)
        .await
        .map_err(|_| RecoveryError::Timeout {
            what: what.to_owned(),
            after: timeout,
        })
}
