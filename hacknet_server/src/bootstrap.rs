//! World construction at server start.

use crate::config::ServerConfig;
use crate::error::ServerError;

use hacknet_core::programs::register_builtins;
use hacknet_core::{CommandQueue, ExecutableRegistry, Persistence, SystemDirectory, VirtualSystem, World};
use hacknet_env::{SystemId, WorldId};
use std::sync::Arc;
use tracing::info;

/// Registry holding every built-in program.
pub fn builtin_registry() -> Arc<ExecutableRegistry> {
    let mut registry = ExecutableRegistry::new();
    register_builtins(&mut registry);
    Arc::new(registry)
}

/// Systems of a freshly created World: one machine, `localhost`, with a
/// `root` admin and an unprivileged `user` owning a couple of files.
pub fn seed_systems() -> Result<SystemDirectory, ServerError> {
    let mut system = VirtualSystem::new(SystemId(1), "localhost").with_account("user", false);
    system.fs.write("/home/user/a.txt", "a")?;
    system.fs.write("/home/user/b.txt", "b")?;
    system.fs.mkdir_p("/var/log")?;

    let mut systems = SystemDirectory::new();
    systems.insert(system);
    Ok(systems)
}

/// Restores each configured World from `persistence`, seeding the ones
/// that have never been synced.
pub fn load_worlds(
    config: &ServerConfig,
    persistence: &dyn Persistence,
    registry: Arc<ExecutableRegistry>,
    queue: Arc<CommandQueue>,
) -> Result<Vec<World>, ServerError> {
    let mut worlds = Vec::with_capacity(config.worlds.len());
    for (index, name) in config.worlds.iter().enumerate() {
        let id = WorldId(index as u32);
        let world = match persistence.load(id)? {
            Some(snapshot) => {
                info!(world = %id, time = snapshot.time, systems = snapshot.systems.len(), "restored world");
                World::from_snapshot(snapshot, registry.clone(), queue.clone())
            }
            None => {
                info!(world = %id, name = %name, "seeded new world");
                World::new(id, name.clone(), seed_systems()?, registry.clone(), queue.clone())
            }
        };
        worlds.push(world);
    }
    Ok(worlds)
}
