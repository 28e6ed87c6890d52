// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Layer
//!
//! Pure types and the contracts (traits) that the infrastructure layer
//! implements. Nothing in here talks to Docker, SQLite or the filesystem.
//!
//! | Module | Contents |
//! |--------|----------|
//! | `service` | `ServiceName`, `ServiceVersion`, `ServiceKey`, `ServiceInstance`, `ServiceFamily` |
//! | `repository` | `ServiceRepository` (record store contract) |
//! | `runtime` | `ServiceRuntime` (container runtime contract) |
//! | `routing` | Proxy dynamic configuration model, `RoutingPolicy`, `RouteStore` |
//! | `events` | `ServiceEvent` |
//! | `build` | `ImageBuilder` |
//! | `credentials` | `CredentialIssuer` |
//! | `notification` | `Notifier` |
//! | `manager_config` | `ManagerConfigManifest` |

pub mod service;
pub mod repository;
pub mod runtime;
pub mod routing;
pub mod events;
pub mod build;
pub mod credentials;
pub mod notification;
pub mod manager_config;
