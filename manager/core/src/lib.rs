// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Skiff Manager Core
//!
//! Service lifecycle and routing-consistency core for the Skiff manager.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Keeps the service record store, the container runtime and
//!   the reverse-proxy routing table in agreement

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;
