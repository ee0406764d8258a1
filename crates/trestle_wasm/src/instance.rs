//! Compute module instantiation and invocation.
//!
//! Instantiation publishes the module's export surface: its linear memory,
//! its allocator pair when present, and otherwise a bump arena seeded from
//! the `__heap_base` marker. The allocation strategy is chosen once here;
//! call sites never probe for optional exports again.
//!
//! Invocation follows the result-channel calling convention: the call id is
//! passed as the first machine word, and the module returns its output by
//! calling the `result_write` import. A non-empty direct return value is a
//! usage warning, not an error.

use crate::arena::{ArenaBacking, BumpArena, PAGE_SIZE};
use crate::channel::ChannelTable;
use crate::host::{self, HostState};
use crate::marshal;
use tokio::sync::mpsc::UnboundedSender;
use trestle_core::{ArgPart, BridgeError, BridgeResult, CallId, WorkerEvent};
use wasmtime::{Config, Engine, Instance, Linker, Memory, Module, OptLevel, Store, TypedFunc, Val};

/// Export name of the module's linear memory
const MEMORY_EXPORT: &str = "memory";
/// Export pair delegating allocation to the module
const ALLOC_EXPORT: &str = "alloc";
const DEALLOC_EXPORT: &str = "dealloc";
/// Heap-base marker seeding the bump arena fallback
const HEAP_BASE_EXPORT: &str = "__heap_base";

/// How argument payloads are placed into guest memory
///
/// Chosen once at instantiation. Bump never reclaims; Delegated forwards to
/// the module's own allocator and keeps no host-side bookkeeping.
pub enum AllocStrategy {
    /// Bump arena over the module's heap base
    Bump(BumpArena),
    /// The module's exported allocator pair
    Delegated {
        /// `alloc(len) -> ptr`
        alloc: TypedFunc<i64, i64>,
        /// `dealloc(ptr, len)`, when the module exports one
        dealloc: Option<TypedFunc<(i64, i64), ()>>,
    },
}

/// An instantiated compute module with its published export surface
pub struct ComputeInstance {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    strategy: AllocStrategy,
}

impl std::fmt::Debug for ComputeInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeInstance").finish_non_exhaustive()
    }
}

impl ComputeInstance {
    /// Instantiate a module and publish its exports
    ///
    /// # Errors
    ///
    /// Returns `Initialization` when the module fails to compile or
    /// instantiate, or exports no linear memory.
    pub fn instantiate(
        wasm: &[u8],
        channels: ChannelTable,
        events: UnboundedSender<WorkerEvent>,
    ) -> BridgeResult<Self> {
        let engine = build_engine()?;
        let module = Module::new(&engine, wasm).map_err(|e| BridgeError::Initialization {
            reason: format!("module compilation failed: {}", e),
        })?;

        let mut store = Store::new(&engine, HostState::new(channels, events));
        let mut linker: Linker<HostState> = Linker::new(&engine);
        host::add_to_linker(&mut linker)?;

        let instance =
            linker
                .instantiate(&mut store, &module)
                .map_err(|e| BridgeError::Initialization {
                    reason: format!("instantiation failed: {}", e),
                })?;

        let memory = instance.get_memory(&mut store, MEMORY_EXPORT).ok_or_else(|| {
            BridgeError::Initialization {
                reason: format!("module exports no `{}`", MEMORY_EXPORT),
            }
        })?;

        let strategy = probe_strategy(&mut store, &instance, memory);

        Ok(Self {
            store,
            instance,
            memory,
            strategy,
        })
    }

    /// Whether allocation is delegated to the module's own allocator
    #[must_use]
    pub fn uses_delegated_allocator(&self) -> bool {
        matches!(self.strategy, AllocStrategy::Delegated { .. })
    }

    /// The bump cursor, when the bump strategy is active
    #[must_use]
    pub fn bump_cursor(&self) -> Option<u64> {
        match &self.strategy {
            AllocStrategy::Bump(arena) => Some(arena.cursor()),
            AllocStrategy::Delegated { .. } => None,
        }
    }

    /// Invoke a named export under the result-channel calling convention
    ///
    /// Marshalled payloads are committed into guest memory, then the export
    /// is called with the call id as its first word followed by the
    /// argument words. Output arrives through the `result_write` import;
    /// this function returns once the export itself has returned.
    ///
    /// # Errors
    ///
    /// `UnknownExport` when the export table lacks the name; typed bridge
    /// errors raised by host imports or allocation; `Internal` for guest
    /// traps.
    pub fn invoke(&mut self, id: CallId, export: &str, parts: &[ArgPart]) -> BridgeResult<()> {
        let func = self
            .instance
            .get_func(&mut self.store, export)
            .ok_or_else(|| BridgeError::UnknownExport {
                export: export.to_string(),
            })?;

        let words = marshal::commit_with(parts, |bytes, align| self.place(bytes, align))?;

        let mut params = Vec::with_capacity(words.len() + 1);
        params.push(Val::I64(id.as_u64() as i64));
        params.extend(words.into_iter().map(|w| Val::I64(w as i64)));

        let result_arity = func.ty(&self.store).results().len();
        let mut results = vec![Val::I64(0); result_arity];

        func.call(&mut self.store, &params, &mut results)
            .map_err(into_bridge_error)?;

        if let Some(value) = results.first() {
            let returned = match value {
                Val::I64(v) => *v != 0,
                Val::I32(v) => *v != 0,
                _ => true,
            };
            if returned {
                tracing::warn!(
                    target: "trestle::wasm",
                    %id,
                    export,
                    ?value,
                    "ignored direct return value; use the result_write import instead"
                );
            }
        }

        Ok(())
    }

    /// Place one payload into guest memory via the selected strategy
    fn place(&mut self, bytes: &[u8], align: u64) -> BridgeResult<u64> {
        match &mut self.strategy {
            AllocStrategy::Bump(arena) => {
                let mut backing = WasmBacking {
                    memory: self.memory,
                    store: &mut self.store,
                };
                let address = arena.allocate(&mut backing, bytes.len() as u64, align)?;
                if !bytes.is_empty() {
                    backing.write(address, bytes)?;
                }
                Ok(address)
            }
            AllocStrategy::Delegated { alloc, .. } => {
                if bytes.is_empty() {
                    return Ok(0);
                }
                let alloc = alloc.clone();
                let address = alloc
                    .call(&mut self.store, bytes.len() as i64)
                    .map_err(|e| BridgeError::Internal {
                        message: format!("delegated alloc failed: {}", e),
                    })? as u64;
                let mut backing = WasmBacking {
                    memory: self.memory,
                    store: &mut self.store,
                };
                backing.write(address, bytes)?;
                Ok(address)
            }
        }
    }
}

/// Arena backing over the module's exported memory
struct WasmBacking<'a> {
    memory: Memory,
    store: &'a mut Store<HostState>,
}

impl ArenaBacking for WasmBacking<'_> {
    fn size(&self) -> u64 {
        self.memory.data_size(&*self.store) as u64
    }

    fn grow_pages(&mut self, pages: u64) -> BridgeResult<()> {
        self.memory
            .grow(&mut *self.store, pages)
            .map(|_| ())
            .map_err(|_| BridgeError::AllocationOverflow {
                requested: pages.saturating_mul(PAGE_SIZE),
            })
    }

    fn write(&mut self, address: u64, bytes: &[u8]) -> BridgeResult<()> {
        let size = self.size();
        let offset =
            usize::try_from(address).map_err(|_| BridgeError::OutOfBoundsAccess {
                address,
                length: bytes.len() as u64,
                size,
            })?;
        self.memory
            .write(&mut *self.store, offset, bytes)
            .map_err(|_| BridgeError::OutOfBoundsAccess {
                address,
                length: bytes.len() as u64,
                size,
            })
    }
}

fn build_engine() -> BridgeResult<Engine> {
    let mut config = Config::new();
    config.cranelift_opt_level(OptLevel::Speed);
    // wasm64 modules carry 64-bit address spaces; allow both layouts
    config.wasm_memory64(true);
    Engine::new(&config).map_err(|e| BridgeError::Initialization {
        reason: format!("engine creation failed: {}", e),
    })
}

/// Choose the allocation strategy from the module's optional exports
fn probe_strategy(
    store: &mut Store<HostState>,
    instance: &Instance,
    memory: Memory,
) -> AllocStrategy {
    if let Ok(alloc) = instance.get_typed_func::<i64, i64>(&mut *store, ALLOC_EXPORT) {
        let dealloc = instance
            .get_typed_func::<(i64, i64), ()>(&mut *store, DEALLOC_EXPORT)
            .ok();
        tracing::debug!(target: "trestle::wasm", "using the module's exported allocator");
        return AllocStrategy::Delegated { alloc, dealloc };
    }

    let heap_base = heap_base_export(store, instance)
        .unwrap_or_else(|| memory.data_size(&mut *store) as u64);
    tracing::debug!(target: "trestle::wasm", heap_base, "using the bump arena");
    AllocStrategy::Bump(BumpArena::new(heap_base))
}

/// Read the `__heap_base` marker, accepting 64-bit or 32-bit globals
fn heap_base_export(store: &mut Store<HostState>, instance: &Instance) -> Option<u64> {
    let global = instance.get_global(&mut *store, HEAP_BASE_EXPORT)?;
    match global.get(&mut *store) {
        Val::I64(v) => Some(v as u64),
        Val::I32(v) => Some(u64::from(v as u32)),
        _ => None,
    }
}

/// Recover typed bridge errors that crossed the trap boundary
fn into_bridge_error(err: wasmtime::Error) -> BridgeError {
    match err.downcast::<BridgeError>() {
        Ok(bridge) => bridge,
        Err(other) => BridgeError::Internal {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use trestle_core::{Argument, LogLevel};

    fn instantiate(
        wat_src: &str,
    ) -> (
        BridgeResult<ComputeInstance>,
        ChannelTable,
        mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        let wasm = wat::parse_str(wat_src).expect("valid wat");
        let channels = ChannelTable::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let result = ComputeInstance::instantiate(&wasm, channels.clone(), tx);
        (result, channels, rx)
    }

    const ECHO: &str = r#"
        (module
          (import "host" "result_write" (func $rw (param i64 i64 i64)))
          (memory (export "memory") 1)
          (global (export "__heap_base") i32 (i32.const 1024))
          (func (export "echo") (param i64 i64 i64)
            (call $rw (local.get 0) (local.get 1) (local.get 2))))
    "#;

    #[test]
    fn test_missing_memory_export_fails_init() {
        let (result, _, _) = instantiate("(module)");
        assert!(matches!(
            result.unwrap_err(),
            BridgeError::Initialization { .. }
        ));
    }

    #[test]
    fn test_invalid_module_fails_init() {
        let channels = ChannelTable::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ComputeInstance::instantiate(b"not wasm", channels, tx);
        assert!(matches!(
            result.unwrap_err(),
            BridgeError::Initialization { .. }
        ));
    }

    #[test]
    fn test_heap_base_i32_global() {
        let (result, _, _) = instantiate(ECHO);
        let instance = result.unwrap();
        assert!(!instance.uses_delegated_allocator());
        assert_eq!(instance.bump_cursor(), Some(1024));
    }

    #[test]
    fn test_heap_base_i64_global() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (memory (export "memory") 1)
              (global (export "__heap_base") i64 (i64.const 4096)))
        "#,
        );
        assert_eq!(result.unwrap().bump_cursor(), Some(4096));
    }

    #[test]
    fn test_heap_base_absent_falls_back_to_memory_end() {
        let (result, _, _) = instantiate(r#"(module (memory (export "memory") 2))"#);
        assert_eq!(result.unwrap().bump_cursor(), Some(2 * PAGE_SIZE));
    }

    #[test]
    fn test_heap_base_unconvertible_falls_back_to_memory_end() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (memory (export "memory") 1)
              (global (export "__heap_base") f64 (f64.const 1.0)))
        "#,
        );
        assert_eq!(result.unwrap().bump_cursor(), Some(PAGE_SIZE));
    }

    #[test]
    fn test_alloc_export_selects_delegated_strategy() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (memory (export "memory") 1)
              (global $next (mut i32) (i32.const 2048))
              (func (export "alloc") (param i64) (result i64)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next
                  (i32.add (global.get $next) (i32.wrap_i64 (local.get 0))))
                (i64.extend_i32_u (local.get $ptr))))
        "#,
        );
        let instance = result.unwrap();
        assert!(instance.uses_delegated_allocator());
        assert_eq!(instance.bump_cursor(), None);
    }

    #[test]
    fn test_invoke_unknown_export() {
        let (result, _, _) = instantiate(ECHO);
        let mut instance = result.unwrap();
        let err = instance
            .invoke(CallId::from_raw(1), "missing", &[])
            .unwrap_err();
        assert_eq!(
            err,
            BridgeError::UnknownExport {
                export: "missing".to_string()
            }
        );
        assert_eq!(err.to_string(), "export missing not found");
    }

    #[test]
    fn test_invoke_echo_round_trips_text() {
        let (result, channels, mut events) = instantiate(ECHO);
        let mut instance = result.unwrap();
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1024);

        let parts = marshal::encode(&["hello".into()]).unwrap();
        instance.invoke(id, "echo", &parts).unwrap();

        assert_eq!(events.try_recv().unwrap(), WorkerEvent::Result { id });
        assert_eq!(channels.detach(id), Some(b"hello".to_vec()));
    }

    #[test]
    fn test_invoke_advances_bump_cursor() {
        let (result, channels, _) = instantiate(ECHO);
        let mut instance = result.unwrap();
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1024);

        let before = instance.bump_cursor().unwrap();
        let parts = marshal::encode(&["0123456789".into()]).unwrap();
        instance.invoke(id, "echo", &parts).unwrap();
        assert_eq!(instance.bump_cursor(), Some(before + 10));
    }

    #[test]
    fn test_result_write_without_channel_is_typed_error() {
        let (result, _, _) = instantiate(ECHO);
        let mut instance = result.unwrap();
        let id = CallId::from_raw(7);
        let parts = marshal::encode(&["x".into()]).unwrap();
        let err = instance.invoke(id, "echo", &parts).unwrap_err();
        assert_eq!(err, BridgeError::UnknownResultChannel { id });
    }

    #[test]
    fn test_out_of_bounds_import_is_typed_error() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (import "host" "log_emit" (func $log (param i64 i64 i64)))
              (memory (export "memory") 1)
              (func (export "bad_log") (param i64)
                (call $log (i64.const 2) (i64.const 2147483647) (i64.const 16))))
        "#,
        );
        let mut instance = result.unwrap();
        let err = instance
            .invoke(CallId::from_raw(1), "bad_log", &[])
            .unwrap_err();
        assert!(matches!(err, BridgeError::OutOfBoundsAccess { .. }));
    }

    #[test]
    fn test_unknown_log_level_is_hard_error() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (import "host" "log_emit" (func $log (param i64 i64 i64)))
              (memory (export "memory") 1)
              (data (i32.const 8) "boom")
              (func (export "loud") (param i64)
                (call $log (i64.const 9) (i64.const 8) (i64.const 4))))
        "#,
        );
        let mut instance = result.unwrap();
        let err = instance
            .invoke(CallId::from_raw(1), "loud", &[])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Internal { .. }));
    }

    #[test]
    fn test_log_emit_forwards_event() {
        let (result, _, mut events) = instantiate(
            r#"
            (module
              (import "host" "log_emit" (func $log (param i64 i64 i64)))
              (memory (export "memory") 1)
              (data (i32.const 16) "ping")
              (func (export "shout") (param i64)
                (call $log (i64.const 2) (i64.const 16) (i64.const 4))))
        "#,
        );
        let mut instance = result.unwrap();
        instance.invoke(CallId::from_raw(1), "shout", &[]).unwrap();
        assert_eq!(
            events.try_recv().unwrap(),
            WorkerEvent::Log {
                level: LogLevel::Info,
                message: "ping".to_string()
            }
        );
    }

    #[test]
    fn test_random_fill_produces_entropy() {
        let (result, channels, _) = instantiate(
            r#"
            (module
              (import "host" "random_fill" (func $rand (param i64 i64)))
              (import "host" "result_write" (func $rw (param i64 i64 i64)))
              (memory (export "memory") 1)
              (func (export "draw") (param i64)
                (call $rand (i64.const 256) (i64.const 32))
                (call $rw (local.get 0) (i64.const 256) (i64.const 32))))
        "#,
        );
        let mut instance = result.unwrap();
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1024);
        instance.invoke(id, "draw", &[]).unwrap();
        let bytes = channels.detach(id).unwrap();
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_mark_emits_timing_event() {
        let (result, _, mut events) = instantiate(
            r#"
            (module
              (import "host" "mark" (func $mark (param i64 i64)))
              (memory (export "memory") 1)
              (data (i32.const 32) "phase1")
              (func (export "timed") (param i64)
                (call $mark (i64.const 32) (i64.const 6))))
        "#,
        );
        let mut instance = result.unwrap();
        instance.invoke(CallId::from_raw(1), "timed", &[]).unwrap();
        match events.try_recv().unwrap() {
            WorkerEvent::Log { level, message } => {
                assert_eq!(level, LogLevel::Info);
                assert!(message.contains("phase1"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_delegated_allocator_round_trip() {
        let (result, channels, _) = instantiate(
            r#"
            (module
              (import "host" "result_write" (func $rw (param i64 i64 i64)))
              (memory (export "memory") 1)
              (global $next (mut i32) (i32.const 2048))
              (func (export "alloc") (param i64) (result i64)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next
                  (i32.add (global.get $next) (i32.wrap_i64 (local.get 0))))
                (i64.extend_i32_u (local.get $ptr)))
              (func (export "echo") (param i64 i64 i64)
                (call $rw (local.get 0) (local.get 1) (local.get 2))))
        "#,
        );
        let mut instance = result.unwrap();
        assert!(instance.uses_delegated_allocator());
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1024);
        let parts = marshal::encode(&["guest owned".into()]).unwrap();
        instance.invoke(id, "echo", &parts).unwrap();
        assert_eq!(channels.detach(id), Some(b"guest owned".to_vec()));
    }

    #[test]
    fn test_direct_return_is_warning_not_error() {
        let (result, channels, mut events) = instantiate(
            r#"
            (module
              (import "host" "result_write" (func $rw (param i64 i64 i64)))
              (memory (export "memory") 1)
              (func (export "answer") (param i64) (result i64)
                (call $rw (local.get 0) (i64.const 0) (i64.const 0))
                (i64.const 42)))
        "#,
        );
        let mut instance = result.unwrap();
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1024);
        instance.invoke(id, "answer", &[]).unwrap();
        assert_eq!(events.try_recv().unwrap(), WorkerEvent::Result { id });
        assert_eq!(channels.detach(id), Some(Vec::new()));
    }

    #[test]
    fn test_trap_is_internal_error() {
        let (result, _, _) = instantiate(
            r#"
            (module
              (memory (export "memory") 1)
              (func (export "crash") (param i64)
                unreachable))
        "#,
        );
        let mut instance = result.unwrap();
        let err = instance
            .invoke(CallId::from_raw(1), "crash", &[])
            .unwrap_err();
        assert!(matches!(err, BridgeError::Internal { .. }));
    }

    #[test]
    fn test_arena_grows_past_initial_memory() {
        let (result, channels, _) = instantiate(
            r#"
            (module
              (import "host" "result_write" (func $rw (param i64 i64 i64)))
              (memory (export "memory") 1)
              (func (export "echo") (param i64 i64 i64)
                (call $rw (local.get 0) (local.get 1) (local.get 2))))
        "#,
        );
        let mut instance = result.unwrap();
        // bump base is end-of-memory; the first placement must grow
        assert_eq!(instance.bump_cursor(), Some(PAGE_SIZE));
        let id = CallId::from_raw(1);
        channels.create(id, 64, 1 << 20);
        let payload = vec![0xA5u8; 1000];
        let parts = marshal::encode(&[Argument::from(payload.clone())]).unwrap();
        instance.invoke(id, "echo", &parts).unwrap();
        assert_eq!(channels.detach(id), Some(payload));
    }
}
