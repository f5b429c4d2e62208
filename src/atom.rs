//! The element-type registry.
//!
//! Every bat stores elements of exactly one atom type. An atom is a small
//! descriptor: a name, a fixed element width (the offset width for
//! var-sized types), a var-sized flag, and an optional per-element unfix
//! callback that the pool invokes when a bat carrying resource-owning
//! elements is destroyed.
//!
//! Type names read from a directory written by a newer server may be
//! unknown here; they are retained symbolically, with the width and
//! var-sized flag recorded in the directory, so that writing the
//! directory back preserves them for the server that understands them.

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::errors::{PoolError, Result};

/// Index into the atom registry.
pub type AtomId = usize;

/// Called once per tail element when a bat of this type is destroyed.
pub type AtomUnfix = fn(&[u8]);

#[derive(Clone)]
struct AtomDesc {
    name: String,
    size: u16,
    varsized: bool,
    unfix: Option<AtomUnfix>,
    // false for types retained symbolically from a directory
    known: bool,
}

pub struct AtomRegistry {
    atoms: RwLock<Vec<AtomDesc>>,
}

static ATOMS: Lazy<AtomRegistry> = Lazy::new(AtomRegistry::bootstrap);

/// The process-wide registry.
pub fn atoms() -> &'static AtomRegistry {
    &ATOMS
}

impl AtomRegistry {
    fn bootstrap() -> Self {
        let builtin = [
            ("void", 0u16, false),
            ("bit", 1, false),
            ("bte", 1, false),
            ("sht", 2, false),
            ("int", 4, false),
            ("flt", 4, false),
            ("dbl", 8, false),
            ("lng", 8, false),
            ("oid", 8, false),
            ("str", 8, true),
        ];
        let atoms = builtin
            .iter()
            .map(|&(name, size, varsized)| AtomDesc {
                name: name.to_string(),
                size,
                varsized,
                unfix: None,
                known: true,
            })
            .collect();
        AtomRegistry {
            atoms: RwLock::new(atoms),
        }
    }

    /// Looks a type up by name.
    pub fn index(&self, name: &str) -> Option<AtomId> {
        self.atoms.read().iter().position(|a| a.name == name)
    }

    /// Registers a caller-defined type. Returns the existing id when the
    /// name is already taken and the shape matches.
    pub fn register(
        &self,
        name: &str,
        size: u16,
        varsized: bool,
        unfix: Option<AtomUnfix>,
    ) -> Result<AtomId> {
        let mut atoms = self.atoms.write();
        if let Some(pos) = atoms.iter().position(|a| a.name == name) {
            let a = &mut atoms[pos];
            if a.size != size || a.varsized != varsized {
                return Err(PoolError::UnknownAtom(name.to_string()));
            }
            // a symbolic placeholder becomes a real type
            a.known = true;
            a.unfix = unfix;
            return Ok(pos);
        }
        atoms.push(AtomDesc {
            name: name.to_string(),
            size,
            varsized,
            unfix,
            known: true,
        });
        Ok(atoms.len() - 1)
    }

    // Retains an on-disk type name this server does not understand.
    pub(crate) fn register_unknown(&self, name: &str, size: u16, varsized: bool) -> AtomId {
        let mut atoms = self.atoms.write();
        if let Some(pos) = atoms.iter().position(|a| a.name == name) {
            return pos;
        }
        atoms.push(AtomDesc {
            name: name.to_string(),
            size,
            varsized,
            unfix: None,
            known: false,
        });
        atoms.len() - 1
    }

    pub fn name(&self, id: AtomId) -> String {
        self.atoms.read()[id].name.clone()
    }

    pub fn size(&self, id: AtomId) -> u16 {
        self.atoms.read()[id].size
    }

    pub fn varsized(&self, id: AtomId) -> bool {
        self.atoms.read()[id].varsized
    }

    pub(crate) fn unfix(&self, id: AtomId) -> Option<AtomUnfix> {
        self.atoms.read()[id].unfix
    }

    pub(crate) fn known(&self, id: AtomId) -> bool {
        self.atoms.read()[id].known
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let reg = AtomRegistry::bootstrap();
        let int = reg.index("int").unwrap();
        assert_eq!(reg.size(int), 4);
        assert!(!reg.varsized(int));

        let str_t = reg.index("str").unwrap();
        assert_eq!(reg.size(str_t), 8);
        assert!(reg.varsized(str_t));

        assert!(reg.index("uuid5").is_none());
    }

    #[test]
    fn test_register_unknown_then_known() {
        let reg = AtomRegistry::bootstrap();
        let id = reg.register_unknown("uuid", 16, false);
        assert!(!reg.known(id));
        assert_eq!(reg.size(id), 16);

        // the upgraded server registers the real thing in place
        let id2 = reg.register("uuid", 16, false, None).unwrap();
        assert_eq!(id, id2);
        assert!(reg.known(id));

        // shape mismatch is rejected
        assert!(reg.register("uuid", 8, false, None).is_err());
    }

    #[test]
    fn test_unfix_callback() {
        fn noop(_: &[u8]) {}
        let reg = AtomRegistry::bootstrap();
        let id = reg.register("handle", 8, false, Some(noop)).unwrap();
        assert!(reg.unfix(id).is_some());
    }
}
