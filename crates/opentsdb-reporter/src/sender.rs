// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

/// Destination for batched metric bytes.
///
/// Delivery is best effort: implementations log and drop data they cannot deliver instead of
/// returning an error, since producers have already been acknowledged.
#[async_trait]
pub trait MetricsSender: Send {
    async fn send_data(&mut self, data: &[u8]);

    fn is_connected(&self) -> bool;
}
