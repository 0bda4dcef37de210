//! Built-in progs

pub mod nic;

use crate::prog::ProgRegistry;

/// Registry holding every built-in prog
pub fn builtin_registry() -> ProgRegistry {
    let mut registry = ProgRegistry::new();
    registry.register(nic::prog());
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = builtin_registry();
        assert_eq!(registry.names(), vec![nic::PROG_NAME]);
    }
}
