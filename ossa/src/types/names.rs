//! Names of lowered functions, selectors and thunks

use std::fmt;

/// Accessor flavor of a property or subscript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AccessorKind {
    Getter,
    Setter,
    MaterializeForSet,
    MaterializeForSetCallback,
    UnsafeAddressor,
    UnsafeMutableAddressor,
    WillSet,
    DidSet,
}

impl AccessorKind {
    /// Accessors that may occupy a vtable slot or witness table entry
    pub fn is_dispatchable(&self) -> bool {
        matches!(
            self,
            AccessorKind::Getter | AccessorKind::Setter | AccessorKind::MaterializeForSet
        )
    }
}

impl fmt::Display for AccessorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessorKind::Getter => "getter",
            AccessorKind::Setter => "setter",
            AccessorKind::MaterializeForSet => "materializeForSet",
            AccessorKind::MaterializeForSetCallback => "materializeForSet.callback",
            AccessorKind::UnsafeAddressor => "unsafeAddressor",
            AccessorKind::UnsafeMutableAddressor => "unsafeMutableAddressor",
            AccessorKind::WillSet => "willSet",
            AccessorKind::DidSet => "didSet",
        };
        write!(f, "{s}")
    }
}

/// Name a subscript is stored under in member tables
pub const SUBSCRIPT: &str = "subscript";

/// `Owner.method`
pub fn method_name(owner: &str, method: &str) -> String {
    format!("{owner}.{method}")
}

/// `prop!getter`, the key of an accessor within its owner
pub fn accessor_key(member: &str, kind: AccessorKind) -> String {
    format!("{member}!{kind}")
}

/// `Owner.prop!getter`
pub fn accessor_name(owner: &str, member: &str, kind: AccessorKind) -> String {
    format!("{owner}.{}", accessor_key(member, kind))
}

/// `#Declaring.key`
pub fn selector(declaring: &str, key: &str) -> String {
    format!("#{declaring}.{key}")
}

/// Member key of a selector, `#Base.foo!getter` -> `foo!getter`
pub fn selector_key(selector: &str) -> &str {
    selector
        .trim_start_matches('#')
        .split_once('.')
        .map(|(_, key)| key)
        .unwrap_or(selector)
}

pub fn witness_thunk_name(conforming: &str, protocol: &str, key: &str) -> String {
    format!("protocol witness for {protocol}.{key} in {conforming}")
}

/// Thunk filling the `selector` slot of `class`'s vtable
pub fn vtable_thunk_name(selector: &str, class: &str) -> String {
    format!("vtable thunk for {selector} in {class}")
}

/// Reabstraction thunks are keyed by their conversion, so equal conversions
/// lowered in different functions share one thunk
pub fn reabstraction_thunk_name(from: &str, to: &str) -> String {
    format!("reabstraction thunk from {from} to {to}")
}

pub fn block_invoke_name(closure_ty: &str) -> String {
    format!("block invoke thunk for {closure_ty}")
}

/// Global variable backing a static stored property
pub fn static_property_global(owner: &str, property: &str) -> String {
    format!("{owner}.{property}")
}

pub fn global_addressor(global: &str) -> String {
    format!("{global}!unsafeMutableAddressor")
}

pub fn global_init_func(global: &str) -> String {
    format!("globalinit_{global}_func")
}

pub fn global_token(global: &str) -> String {
    format!("globalinit_{global}_token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessor_names() {
        assert_eq!(
            accessor_name("A", SUBSCRIPT, AccessorKind::UnsafeMutableAddressor),
            "A.subscript!unsafeMutableAddressor"
        );
        assert_eq!(selector("Base", &accessor_key("x", AccessorKind::Getter)), "#Base.x!getter");
    }

    #[test]
    fn test_selector_key() {
        assert_eq!(selector_key("#Base.x!getter"), "x!getter");
        assert_eq!(selector_key("#C.run"), "run");
    }

    #[test]
    fn test_addressors_not_dispatchable() {
        assert!(!AccessorKind::UnsafeAddressor.is_dispatchable());
        assert!(!AccessorKind::UnsafeMutableAddressor.is_dispatchable());
        assert!(AccessorKind::MaterializeForSet.is_dispatchable());
    }
}
