// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod names;
pub mod rules;
pub mod table;
pub mod txn;

pub use rules::MetricRules;
pub use table::{Metric, MetricData, MetricForce, MetricId, MetricTable};
