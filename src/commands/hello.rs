//! The `hello` command package.
//!
//! Four variants of the same greeting, one per offload strategy: inline,
//! one-shot worker process, in-server state, persistent worker process.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::daemon::child::{WorkerCallback, WorkerCatalog};
use crate::daemon::protocol::Message;
use crate::daemon::registry::HandlerResult;
use crate::daemon::server::Server;

pub const DEFAULT_PLANET: &str = "Jupiter";
pub const INITIAL_STATE: &str = "init";

pub const PLANET_STATE_FACTORY: &str = "planet_state";
pub const CPU_WORK_FACTORY: &str = "cpu_work";

const PERSISTENT_STATE_KEY: &str = "hello_persistent_state";
const PROCESS_WORKER_KEY: &str = "hello_process";

/// Upper bound (exclusive) of the sum computed by [`cpu_work`]
const CPU_WORK_LIMIT: u64 = 10_000_000;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanetArgs {
    pub planet: Option<String>,
}

impl PlanetArgs {
    fn planet(self) -> String {
        self.planet.unwrap_or_else(|| DEFAULT_PLANET.to_string())
    }
}

pub fn register(server: &Server) {
    server.register("hello", hello);
    server.register("hello_slow", hello_slow);
    server.register("hello_persistent", hello_persistent);
    server.register("hello_process", hello_process);
}

/// Worker factories backing the process variants
pub fn register_workers(catalog: &mut WorkerCatalog) {
    catalog.register(PLANET_STATE_FACTORY, || {
        Ok(Box::new(PlanetState::new()) as Box<dyn WorkerCallback>)
    });
    catalog.register(CPU_WORK_FACTORY, || {
        Ok(Box::new(|_payload: Value| -> anyhow::Result<Value> { Ok(json!(cpu_work().to_string())) })
            as Box<dyn WorkerCallback>)
    });
}

async fn hello(_server: Arc<Server>, message: Message, args: PlanetArgs) -> HandlerResult {
    info!("Hello {}!", args.planet());
    Ok(message)
}

async fn hello_slow(server: Arc<Server>, message: Message, args: PlanetArgs) -> HandlerResult {
    let planet = args.planet();
    let result = server.run_process_job(CPU_WORK_FACTORY, Value::Null).await?;

    info!("Hello {}! The result is {}", planet, result);
    Ok(message.with_field("result", result))
}

async fn hello_persistent(server: Arc<Server>, message: Message, args: PlanetArgs) -> HandlerResult {
    let state = server
        .store()
        .get_or_insert_with(PERSISTENT_STATE_KEY, PlanetState::new)?;

    let (old_planet, new_planet) = state.operate(args.planet());

    info!(
        "Hello! The old planet was {}. The new planet is {}",
        old_planet, new_planet
    );
    Ok(message
        .with_field("old_planet", old_planet)
        .with_field("new_planet", new_planet))
}

async fn hello_process(server: Arc<Server>, message: Message, args: PlanetArgs) -> HandlerResult {
    let worker = server.worker(PROCESS_WORKER_KEY, PLANET_STATE_FACTORY)?;

    let reply = match server.run_worker_job(&worker, json!(args.planet())).await {
        Ok(reply) => reply,
        Err(e) if e.is_worker_unavailable() => {
            warn!("Planet worker unavailable: {}", e);
            return Ok(message);
        }
        Err(e) => return Err(e.into()),
    };

    let (old_planet, new_planet): (String, String) = serde_json::from_value(reply)?;
    info!(
        "Hello! The old planet was {}. The new planet is {}",
        old_planet, new_planet
    );
    Ok(message
        .with_field("old_planet", old_planet)
        .with_field("new_planet", new_planet))
}

/// Remembers the last planet it was given
#[derive(Debug)]
pub struct PlanetState {
    current: Mutex<String>,
}

impl PlanetState {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(INITIAL_STATE.to_string()),
        }
    }

    /// Replace the current planet, returning `(old, new)`
    pub fn operate(&self, planet: String) -> (String, String) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        let old = std::mem::replace(&mut *current, planet.clone());
        (old, planet)
    }
}

impl Default for PlanetState {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerCallback for PlanetState {
    fn call(&mut self, payload: Value) -> anyhow::Result<Value> {
        let planet = match payload {
            Value::String(planet) => planet,
            other => anyhow::bail!("expected a planet name, got {}", other),
        };
        let (old, new) = self.operate(planet);
        Ok(json!([old, new]))
    }
}

/// Sum of `i * i` for `i` in `0..10^7`
pub fn cpu_work() -> u128 {
    (0..CPU_WORK_LIMIT).map(|i| u128::from(i) * u128::from(i)).sum()
}
