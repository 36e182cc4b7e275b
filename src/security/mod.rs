// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Security helpers shared by the stores and the auth layer.

pub mod locks;

pub use locks::{resilient_lock, resilient_read, resilient_write};

use subtle::ConstantTimeEq;

/// Compare two secrets without leaking their common prefix length through timing.
pub fn constant_time_eq(supplied: &str, expected: &str) -> bool {
    supplied.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Mask a secret for display, keeping only a short prefix.
pub fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    if secret.chars().count() > 8 {
        format!("{}...", prefix)
    } else {
        "****".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("admin123", "admin123"));
        assert!(!constant_time_eq("admin124", "admin123"));
        assert!(!constant_time_eq("admin", "admin123"));
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("sk-or-abcdefgh"), "sk-o...");
        assert_eq!(mask_secret("short"), "****");
    }
}
