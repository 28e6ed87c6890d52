// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process credential issuer
//
// Stand-in for the external auth service: tokens live only in memory and are
// lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::domain::credentials::{CredentialError, CredentialId, CredentialIssuer, IssuedCredential};

#[derive(Clone, Default)]
pub struct LocalCredentialIssuer {
    tokens: Arc<RwLock<HashMap<CredentialId, String>>>,
}

impl LocalCredentialIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_valid(&self, token: &str) -> bool {
        self.tokens.read().await.values().any(|t| t == token)
    }

    pub async fn active_count(&self) -> usize {
        self.tokens.read().await.len()
    }
}

#[async_trait]
impl CredentialIssuer for LocalCredentialIssuer {
    async fn issue(&self) -> Result<IssuedCredential, CredentialError> {
        let id = CredentialId::new();
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        self.tokens.write().await.insert(id, token.clone());
        debug!("Issued service credential {}", id);
        Ok(IssuedCredential { id, token })
    }

    async fn revoke(&self, id: CredentialId) -> Result<(), CredentialError> {
        match self.tokens.write().await.remove(&id) {
            Some(_) => {
                debug!("Revoked service credential {}", id);
                Ok(())
            }
            None => Err(CredentialError::NotFound(id)),
        }
    }
}
