// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reference rewriting.
//!
//! A reference value holds a *source* entity id. Before it can be written to
//! the destination it is replaced by the referenced entity's destination
//! identifier, obtained through the same [`IdentityResolver`] that resolves
//! fact targets. Sharing the resolver is what makes a reference to an entity
//! created in the same transaction reuse that entity's placeholder.

use crate::error::{MirrorError, Result};
use crate::identity::IdentityResolver;
use crate::model::{AttributeInfo, TxValue, Value};

/// Rewrite `value` for `attribute` into a destination value.
///
/// Non-reference values pass through unchanged. A value whose shape disagrees
/// with the attribute's declared type is rejected.
pub fn rewrite_value(
    resolver: &mut IdentityResolver<'_>,
    attribute: &AttributeInfo,
    value: &Value,
) -> Result<TxValue> {
    match (attribute.is_ref(), value) {
        (true, Value::Ref(source)) => Ok(TxValue::Ref(resolver.resolve(*source).target.clone())),
        (true, other) => Err(MirrorError::translation(
            resolver.t(),
            format!(
                "reference attribute {} carries non-reference value {}",
                attribute.ident, other
            ),
        )),
        (false, Value::Ref(source)) => Err(MirrorError::translation(
            resolver.t(),
            format!(
                "attribute {} is not a reference but carries entity {}",
                attribute.ident, source
            ),
        )),
        (false, other) => Ok(TxValue::Value(other.clone())),
    }
}
