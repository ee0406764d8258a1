//! Prove/verify convenience wrappers over the TRESTLE bridge.
//!
//! A thin façade: it turns duck-typed JSON arguments into the bridge's
//! closed argument set and names the prover module's exports. The proving
//! and verification semantics live entirely inside the compute module; the
//! bridge treats them as opaque.

#![warn(missing_docs)]
#![warn(clippy::all)]

use trestle_bridge::{BridgeConfig, WorkerHandle};
use trestle_core::{Argument, BridgeError, BridgeResult};

/// Export invoked by [`Prover::execute_and_prove`]
const PROVE_EXPORT: &str = "execute_and_prove";
/// Export invoked by [`Prover::verify`]
const VERIFY_EXPORT: &str = "verify";

/// A prover module behind a worker handle
pub struct Prover {
    handle: WorkerHandle,
}

impl Prover {
    /// Wrap an already-spawned worker handle
    #[must_use]
    pub fn new(handle: WorkerHandle) -> Self {
        Self { handle }
    }

    /// Spawn and initialize a worker for a prover module
    ///
    /// # Errors
    ///
    /// Propagates spawn and initialization failures.
    pub async fn from_module(module: Vec<u8>) -> BridgeResult<Self> {
        let handle = WorkerHandle::spawn(module, BridgeConfig::new())?;
        handle.init().await?;
        Ok(Self { handle })
    }

    /// Execute a program and produce a proof of execution
    ///
    /// `executable_json` is the serialized executable; `args` are the
    /// program arguments as a JSON array. Returns the module's
    /// JSON-serialized proof.
    ///
    /// # Errors
    ///
    /// `UnsupportedArgumentKind`/`ArgumentRange` for arguments outside the
    /// closed set; any bridge error raised while the call was in flight.
    pub async fn execute_and_prove(
        &self,
        executable_json: &str,
        args: &serde_json::Value,
    ) -> BridgeResult<String> {
        let mut call_args = vec![Argument::from(executable_json)];
        match args {
            serde_json::Value::Array(items) => {
                for item in items {
                    call_args.push(Argument::from_json(item)?);
                }
            }
            other => call_args.push(Argument::from_json(other)?),
        }

        let bytes = self.handle.call(PROVE_EXPORT, &call_args).await?;
        String::from_utf8(bytes).map_err(|e| BridgeError::Internal {
            message: format!("proof is not valid UTF-8: {}", e),
        })
    }

    /// Verify a JSON-serialized proof
    ///
    /// # Errors
    ///
    /// Any bridge error raised while the call was in flight.
    pub async fn verify(&self, proof_json: &str) -> BridgeResult<bool> {
        let bytes = self
            .handle
            .call(VERIFY_EXPORT, &[Argument::from(proof_json)])
            .await?;
        Ok(matches!(bytes.as_slice(), b"true" | b"1"))
    }

    /// The underlying worker handle
    #[must_use]
    pub fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Tear the worker down, rejecting any pending calls
    pub fn terminate(&self) {
        self.handle.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A stand-in prover: `execute_and_prove` echoes the executable back as
    /// the "proof"; `verify` always reports true.
    const FAKE_PROVER: &str = r#"
        (module
          (import "host" "result_write" (func $rw (param i64 i64 i64)))
          (memory (export "memory") 1)
          (global (export "__heap_base") i32 (i32.const 1024))
          (data (i32.const 16) "true")
          (func (export "execute_and_prove") (param i64 i64 i64 i64)
            (call $rw (local.get 0) (local.get 1) (local.get 2)))
          (func (export "verify") (param i64 i64 i64)
            (call $rw (local.get 0) (i64.const 16) (i64.const 4))))
    "#;

    async fn spawn_prover() -> Prover {
        let wasm = wat::parse_str(FAKE_PROVER).expect("valid wat");
        Prover::from_module(wasm).await.expect("prover init")
    }

    #[tokio::test]
    async fn test_execute_and_prove_round_trip() {
        let prover = spawn_prover().await;
        let executable = r#"{"program":"is_prime"}"#;
        let proof = prover
            .execute_and_prove(executable, &json!([100]))
            .await
            .unwrap();
        assert_eq!(proof, executable);
        prover.terminate();
    }

    #[tokio::test]
    async fn test_verify_reports_verdict() {
        let prover = spawn_prover().await;
        assert!(prover.verify(r#"{"proof":"some-proof"}"#).await.unwrap());
        prover.terminate();
    }

    #[tokio::test]
    async fn test_unsupported_json_argument() {
        let prover = spawn_prover().await;
        let err = prover
            .execute_and_prove("{}", &json!([{"nested": true}]))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedArgumentKind { .. }));
        prover.terminate();
    }
}
