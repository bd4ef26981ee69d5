// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod agent;
pub mod error;
pub mod events;
pub mod handlers;
pub mod plan;
pub mod repository;
pub mod rubric;
pub mod state;
pub mod tenant;
pub mod validation;
pub mod workflow;
