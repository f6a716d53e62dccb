//! Backend registry: which module owns each filesystem id, and the live
//! instance serving it while mounted.
//!
//! The `fs_id -> module` side is append-only. Unmounting drops the instance
//! but keeps the module entry, so a handle minted under a dead `fs_id`
//! still decodes to a known filesystem and can be answered with
//! `NFSERR_STALE` instead of being indistinguishable from garbage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::Backend;
use crate::BackendModule;
use crate::handle::FsId;

/// Filesystem-id allocation plus the module and instance tables.
pub struct BackendRegistry {
    modules: HashMap<FsId, Arc<dyn BackendModule>>,
    instances: HashMap<FsId, Box<dyn Backend>>,
    last_fs_id: u32,
}

impl BackendRegistry {
    /// Create an empty registry. The first allocated id is 1.
    pub fn new() -> BackendRegistry {
        BackendRegistry {
            modules: HashMap::new(),
            instances: HashMap::new(),
            last_fs_id: 0,
        }
    }

    /// Allocate the next filesystem id and record its owning module.
    pub fn allocate(&mut self, module: Arc<dyn BackendModule>) -> FsId {
        self.last_fs_id += 1;
        let fs_id = FsId(self.last_fs_id);
        self.modules.insert(fs_id, module);
        fs_id
    }

    /// Install the live instance for a freshly allocated id.
    pub fn install(&mut self, fs_id: FsId, instance: Box<dyn Backend>) {
        self.instances.insert(fs_id, instance);
    }

    /// The module registered for an id, mounted or not.
    pub fn module(&self, fs_id: FsId) -> Option<&Arc<dyn BackendModule>> {
        self.modules.get(&fs_id)
    }

    /// Whether the id currently has a live instance.
    pub fn is_live(&self, fs_id: FsId) -> bool {
        self.instances.contains_key(&fs_id)
    }

    /// Mutable access to the live instance for an id.
    pub fn instance_mut(&mut self, fs_id: FsId) -> Option<&mut Box<dyn Backend>> {
        self.instances.get_mut(&fs_id)
    }

    /// Detach the live instance, leaving the module entry behind.
    pub fn remove_instance(&mut self, fs_id: FsId) -> Option<Box<dyn Backend>> {
        self.instances.remove(&fs_id)
    }
}

impl Default for BackendRegistry {
    fn default() -> BackendRegistry {
        BackendRegistry::new()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("known", &self.modules.len())
            .field("live", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FsError;
    use crate::MountOpts;
    use crate::NodeId;

    struct NullModule;

    impl BackendModule for NullModule {
        fn name(&self) -> &str {
            "null"
        }

        fn init(&self, _opts: &MountOpts) -> Result<(NodeId, Box<dyn Backend>), FsError> {
            Ok((NodeId(1), Box::new(NullBackend)))
        }
    }

    struct NullBackend;

    impl Backend for NullBackend {}

    #[test]
    fn ids_are_monotone_from_one() {
        let mut reg = BackendRegistry::new();
        let module: Arc<dyn BackendModule> = Arc::new(NullModule);
        assert_eq!(reg.allocate(module.clone()), FsId(1));
        assert_eq!(reg.allocate(module.clone()), FsId(2));
        assert_eq!(reg.allocate(module), FsId(3));
    }

    #[test]
    fn module_survives_instance_removal() {
        let mut reg = BackendRegistry::new();
        let module: Arc<dyn BackendModule> = Arc::new(NullModule);
        let fs_id = reg.allocate(module);
        reg.install(fs_id, Box::new(NullBackend));
        assert!(reg.is_live(fs_id));

        assert!(reg.remove_instance(fs_id).is_some());
        assert!(!reg.is_live(fs_id));
        assert!(reg.module(fs_id).is_some());
        assert!(reg.remove_instance(fs_id).is_none());
    }

    #[test]
    fn unknown_id_is_not_live() {
        let reg = BackendRegistry::new();
        assert!(!reg.is_live(FsId(7)));
        assert!(reg.module(FsId(7)).is_none());
    }
}
