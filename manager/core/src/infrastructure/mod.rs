// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Infrastructure Layer
//
// Adapters implementing the domain contracts against real substrates:
// SQLite (record store), Docker via bollard (runtime), the proxy's file
// provider directory (routes), s2i (image builds) and an in-process
// broadcast bus (events and notifications).

pub mod builder;
pub mod credentials;
pub mod db;
pub mod event_bus;
pub mod proxy;
pub mod repositories;
pub mod runtime;
