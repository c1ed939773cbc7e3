//! Kernel module registry
//!
//! Modules arrive already linked; the registry only tracks which are live
//! and runs their entry points. A module whose `init` fails is never
//! registered. Load order is remembered so teardown runs in reverse.

use alloc::vec::Vec;
use core::fmt;

/// A statically linked kernel module
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    /// Bring the module up; `Err` carries the module's status code
    pub init: fn() -> Result<(), i32>,
    /// Tear the module down; `Err` means kernel state can no longer be
    /// trusted
    pub exit: fn() -> Result<(), i32>,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .finish()
    }
}

/// Why a module operation failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleError {
    /// A module with this name is already loaded
    DuplicateName(&'static str),
    /// `init` returned this status; the module was not registered
    InitFailed(i32),
    /// No loaded module has this name
    NotLoaded,
    /// `exit` returned this status
    ExitFailed(i32),
}

/// Loaded modules in load order
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    loaded: Vec<ModuleDescriptor>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self { loaded: Vec::new() }
    }

    /// Run `module.init` and register it if that succeeds.
    pub fn load(&mut self, module: ModuleDescriptor) -> Result<(), ModuleError> {
        if self.is_loaded(module.name) {
            return Err(ModuleError::DuplicateName(module.name));
        }
        (module.init)().map_err(ModuleError::InitFailed)?;
        self.loaded.push(module);
        Ok(())
    }

    /// Load `modules` in order. If one fails, the ones loaded by this call
    /// are unloaded again in reverse order and the failure is returned with
    /// the offending name.
    pub fn load_all(
        &mut self,
        modules: &[ModuleDescriptor],
    ) -> Result<(), (&'static str, ModuleError)> {
        let start = self.loaded.len();
        for module in modules {
            if let Err(e) = self.load(*module) {
                while self.loaded.len() > start {
                    if let Some(done) = self.loaded.pop() {
                        if let Err(code) = (done.exit)() {
                            return Err((done.name, ModuleError::ExitFailed(code)));
                        }
                    }
                }
                return Err((module.name, e));
            }
        }
        Ok(())
    }

    /// Unregister `name` and run its `exit`.
    pub fn unload(&mut self, name: &str) -> Result<(), ModuleError> {
        let index = self
            .loaded
            .iter()
            .position(|m| m.name == name)
            .ok_or(ModuleError::NotLoaded)?;
        let module = self.loaded.remove(index);
        (module.exit)().map_err(ModuleError::ExitFailed)
    }

    /// Unload everything, newest first. Stops at the first failed `exit`.
    pub fn unload_all(&mut self) -> Result<(), (&'static str, ModuleError)> {
        while let Some(module) = self.loaded.pop() {
            (module.exit)().map_err(|code| (module.name, ModuleError::ExitFailed(code)))?;
        }
        Ok(())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|m| m.name == name)
    }

    /// Names of loaded modules, oldest first.
    pub fn loaded(&self) -> Vec<&'static str> {
        self.loaded.iter().map(|m| m.name).collect()
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Each test gets its own journal so tests can run in parallel
    macro_rules! journal {
        ($log:ident) => {
            static $log: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        };
    }

    #[test]
    fn test_load_and_unload() {
        journal!(LOG);
        let module = ModuleDescriptor {
            name: "ext2",
            description: "second extended filesystem",
            init: || {
                LOG.lock().unwrap().push("ext2 init");
                Ok(())
            },
            exit: || {
                LOG.lock().unwrap().push("ext2 exit");
                Ok(())
            },
        };

        let mut registry = ModuleRegistry::new();
        registry.load(module).unwrap();
        assert!(registry.is_loaded("ext2"));
        assert_eq!(
            registry.load(module),
            Err(ModuleError::DuplicateName("ext2"))
        );

        registry.unload("ext2").unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.unload("ext2"), Err(ModuleError::NotLoaded));
        assert_eq!(*LOG.lock().unwrap(), ["ext2 init", "ext2 exit"]);
    }

    #[test]
    fn test_failed_init_not_registered() {
        let mut registry = ModuleRegistry::new();
        let result = registry.load(ModuleDescriptor {
            name: "hdaudio",
            description: "",
            init: || Err(19),
            exit: || Ok(()),
        });
        assert_eq!(result, Err(ModuleError::InitFailed(19)));
        assert!(!registry.is_loaded("hdaudio"));
    }

    #[test]
    fn test_load_all_rolls_back_in_reverse() {
        journal!(LOG);
        let modules = [
            ModuleDescriptor {
                name: "a",
                description: "",
                init: || Ok(()),
                exit: || {
                    LOG.lock().unwrap().push("a");
                    Ok(())
                },
            },
            ModuleDescriptor {
                name: "b",
                description: "",
                init: || Ok(()),
                exit: || {
                    LOG.lock().unwrap().push("b");
                    Ok(())
                },
            },
            ModuleDescriptor {
                name: "c",
                description: "",
                init: || Err(5),
                exit: || Ok(()),
            },
        ];

        let mut registry = ModuleRegistry::new();
        assert_eq!(
            registry.load_all(&modules),
            Err(("c", ModuleError::InitFailed(5)))
        );
        assert!(registry.is_empty());
        assert_eq!(*LOG.lock().unwrap(), ["b", "a"]);
    }

    #[test]
    fn test_unload_all_newest_first() {
        journal!(LOG);
        let mut registry = ModuleRegistry::new();
        registry
            .load_all(&[
                ModuleDescriptor {
                    name: "first",
                    description: "",
                    init: || Ok(()),
                    exit: || {
                        LOG.lock().unwrap().push("first");
                        Ok(())
                    },
                },
                ModuleDescriptor {
                    name: "second",
                    description: "",
                    init: || Ok(()),
                    exit: || {
                        LOG.lock().unwrap().push("second");
                        Ok(())
                    },
                },
            ])
            .unwrap();
        assert_eq!(registry.loaded(), ["first", "second"]);

        registry.unload_all().unwrap();
        assert_eq!(*LOG.lock().unwrap(), ["second", "first"]);
    }

    #[test]
    fn test_failed_exit_reported() {
        let mut registry = ModuleRegistry::new();
        registry
            .load(ModuleDescriptor {
                name: "stuck",
                description: "",
                init: || Ok(()),
                exit: || Err(-1),
            })
            .unwrap();
        assert_eq!(registry.unload("stuck"), Err(ModuleError::ExitFailed(-1)));
        assert!(!registry.is_loaded("stuck"));
    }
}
