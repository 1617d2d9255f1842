//! Kernel-execution interface.
//!
//! Kernels are the opaque compute routines instructions carry. The scheduler
//! never looks inside them: a stream type hands a kernel its [`KernelContext`]
//! and records whatever `Result` comes back in the instruction's status buffer.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;
use thiserror::Error;

use super::device::Device;
use super::instruction::OperandAccess;
use crate::object::{LogicalObjectId, ObjectBuffer};

/// Structured failure reported by a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{opcode}: {message}")]
pub struct KernelError {
    pub opcode: String,
    pub message: String,
}

impl KernelError {
    pub fn new(opcode: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            message: message.into(),
        }
    }
}

/// An operand resolved to its object's buffer when the instruction was admitted.
#[derive(Debug, Clone)]
pub struct BoundOperand {
    object: LogicalObjectId,
    access: OperandAccess,
    buffer: ObjectBuffer,
}

impl BoundOperand {
    pub(crate) fn new(object: LogicalObjectId, access: OperandAccess, buffer: ObjectBuffer) -> Self {
        Self {
            object,
            access,
            buffer,
        }
    }

    pub fn object(&self) -> LogicalObjectId {
        self.object
    }

    pub fn access(&self) -> OperandAccess {
        self.access
    }
}

/// View of one instruction handed to its kernel.
pub struct KernelContext<'a> {
    opcode: &'a str,
    device: Device,
    operands: &'a [BoundOperand],
    attrs: &'a Value,
}

impl<'a> KernelContext<'a> {
    pub fn new(opcode: &'a str, device: Device, operands: &'a [BoundOperand], attrs: &'a Value) -> Self {
        Self {
            opcode,
            device,
            operands,
            attrs,
        }
    }

    pub fn opcode(&self) -> &str {
        self.opcode
    }

    /// Device of the stream executing the kernel.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn attrs(&self) -> &Value {
        self.attrs
    }

    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    pub fn object(&self, index: usize) -> Result<LogicalObjectId, KernelError> {
        self.operand(index).map(BoundOperand::object)
    }

    pub fn access(&self, index: usize) -> Result<OperandAccess, KernelError> {
        self.operand(index).map(BoundOperand::access)
    }

    pub fn read(&self, index: usize) -> Result<RwLockReadGuard<'a, Vec<u8>>, KernelError> {
        Ok(self.operand(index)?.buffer.read())
    }

    /// Write access; refused for operands declared read-only.
    pub fn write(&self, index: usize) -> Result<RwLockWriteGuard<'a, Vec<u8>>, KernelError> {
        let operand = self.operand(index)?;
        if !operand.access.is_write() {
            return Err(self.fail(format!(
                "operand {index} ({}) is read-only",
                operand.object
            )));
        }
        Ok(operand.buffer.write())
    }

    pub fn attr_u64(&self, key: &str) -> Result<u64, KernelError> {
        self.attrs
            .get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.fail(format!("missing unsigned attribute `{key}`")))
    }

    /// A byte-size attribute, bounded by [`builtin::MAX_BUFFER_BYTES`].
    pub fn attr_size(&self, key: &str) -> Result<usize, KernelError> {
        let size = self.attr_u64(key)?;
        if size > builtin::MAX_BUFFER_BYTES {
            return Err(self.fail(format!(
                "`{key}` of {size} bytes exceeds {}",
                builtin::MAX_BUFFER_BYTES
            )));
        }
        usize::try_from(size).map_err(|_| self.fail(format!("`{key}` of {size} bytes does not fit in memory")))
    }

    pub fn fail(&self, message: impl Into<String>) -> KernelError {
        KernelError::new(self.opcode, message)
    }

    fn operand(&self, index: usize) -> Result<&'a BoundOperand, KernelError> {
        let operands: &'a [BoundOperand] = self.operands;
        operands.get(index).ok_or_else(|| {
            self.fail(format!(
                "operand {index} out of range ({} operands)",
                operands.len()
            ))
        })
    }
}

/// A compute routine registered under an opcode.
pub trait Kernel: Send + Sync {
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), KernelError>;
}

impl<F> Kernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync,
{
    fn compute(&self, ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        self(ctx)
    }
}

/// Runs a kernel, turning a panic into a [`KernelError`] so worker and device
/// threads survive misbehaving kernels.
pub(crate) fn invoke(kernel: &dyn Kernel, ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
    let opcode = ctx.opcode().to_string();
    match panic::catch_unwind(AssertUnwindSafe(|| kernel.compute(ctx))) {
        Ok(result) => result,
        Err(payload) => Err(KernelError::new(
            opcode,
            format!("kernel panicked: {}", panic_message(payload.as_ref())),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Opcode → kernel table consulted at submission time.
#[derive(Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, Arc<dyn Kernel>>,
}

impl KernelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the [`builtin`] kernels.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(builtin::MALLOC, builtin::malloc);
        registry.register(builtin::FREE, builtin::free);
        registry.register(builtin::FILL, builtin::fill);
        registry.register(builtin::COPY, builtin::copy);
        registry
    }

    pub fn register<F>(&mut self, opcode: impl Into<String>, kernel: F)
    where
        F: Fn(&mut KernelContext<'_>) -> Result<(), KernelError> + Send + Sync + 'static,
    {
        self.register_kernel(opcode, Arc::new(kernel));
    }

    pub fn register_kernel(&mut self, opcode: impl Into<String>, kernel: Arc<dyn Kernel>) {
        self.kernels.insert(opcode.into(), kernel);
    }

    pub fn get(&self, opcode: &str) -> Option<Arc<dyn Kernel>> {
        self.kernels.get(opcode).cloned()
    }

    pub fn contains(&self, opcode: &str) -> bool {
        self.kernels.contains_key(opcode)
    }

    pub fn opcodes(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.kernels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("opcodes", &self.opcodes())
            .finish()
    }
}

/// Allocation and transfer kernels every virtual machine understands.
pub mod builtin {
    use super::{KernelContext, KernelError};

    /// `malloc(out)`, attr `size`: resize `out` to `size` zero bytes.
    pub const MALLOC: &str = "malloc";
    /// `free(out)`: drop the contents of `out`.
    pub const FREE: &str = "free";
    /// `fill(out)`, attrs `value` and optional `size`.
    pub const FILL: &str = "fill";
    /// `copy(src, dst)`.
    pub const COPY: &str = "copy";
    /// Largest `size` the allocating kernels accept.
    pub const MAX_BUFFER_BYTES: u64 = 1 << 30;

    pub(super) fn malloc(ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        let size = ctx.attr_size("size")?;
        let mut buffer = ctx.write(0)?;
        buffer.clear();
        buffer.resize(size, 0);
        Ok(())
    }

    pub(super) fn free(ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        let mut buffer = ctx.write(0)?;
        buffer.clear();
        buffer.shrink_to_fit();
        Ok(())
    }

    pub(super) fn fill(ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        let value = ctx.attr_u64("value")?;
        let byte = u8::try_from(value).map_err(|_| ctx.fail(format!("fill value {value} exceeds a byte")))?;
        let size = match ctx.attrs().get("size") {
            Some(_) => Some(ctx.attr_size("size")?),
            None => None,
        };
        let mut buffer = ctx.write(0)?;
        if let Some(size) = size {
            buffer.resize(size, 0);
        }
        buffer.fill(byte);
        Ok(())
    }

    pub(super) fn copy(ctx: &mut KernelContext<'_>) -> Result<(), KernelError> {
        let source = ctx.read(0)?.clone();
        let mut target = ctx.write(1)?;
        *target = source;
        Ok(())
    }
}
