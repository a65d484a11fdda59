// This module defines what the compiler knows about the method it compiles and the
// VmAdaptor trait, the bridge between JET and the embedding virtual machine. MethodInfo
// carries the bytecode, frame limits, exception-handler table and access flags. The
// VmAdaptor answers everything that needs the VM's class model: resolving classes,
// fields and methods named by constant-pool indices (any of which may fail and return
// None, which the compiler turns into a linking-error throw at run time), object and
// array layout, the addresses of the runtime helpers generated code calls, the
// addresses of JVMTI notification flags and the safepoint flag, and the VM-wide modes
// that change code shape: lazy resolution and compressed references.

//! Method description and the VM collaborator interface.

use super::jtype::{parse_method_descriptor, JType};

/// Opaque VM handle of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClassHandle(pub u64);

/// Opaque VM handle of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MethodHandle(pub u64);

/// Access flags relevant to code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MethodFlags {
    pub is_static: bool,
    pub is_synchronized: bool,
}

/// One entry of the bytecode exception table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub start_pc: u32,
    pub end_pc: u32,
    pub handler_pc: u32,
    /// Constant-pool index of the caught class; `None` catches everything.
    pub catch_type: Option<u16>,
}

/// A method to compile.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub class_name: String,
    pub name: String,
    pub descriptor: String,
    pub flags: MethodFlags,
    pub handle: MethodHandle,
    pub class: ClassHandle,
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub handlers: Vec<ExceptionHandler>,
}

impl MethodInfo {
    pub fn full_name(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }

    /// Argument types as passed, including `this` for instance methods.
    pub fn arg_types(&self) -> Vec<JType> {
        let mut args = Vec::new();
        if !self.flags.is_static {
            args.push(JType::Ref);
        }
        if let Some((declared, _)) = parse_method_descriptor(&self.descriptor) {
            args.extend(declared.into_iter().map(JType::stack_type));
        }
        args
    }

    pub fn ret_type(&self) -> JType {
        parse_method_descriptor(&self.descriptor)
            .map(|(_, r)| r.stack_type())
            .unwrap_or(JType::Void)
    }

    /// Number of local slots occupied by incoming arguments.
    pub fn in_slots(&self) -> usize {
        self.arg_types().iter().map(|t| t.slots()).sum()
    }
}

/// Invocation bytecode flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
}

/// A resolved field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    pub jt: JType,
    /// Byte offset within the object for instance fields.
    pub offset: i32,
    /// Absolute address of the storage for static fields.
    pub static_addr: u64,
    pub class: ClassHandle,
    pub class_initialized: bool,
    pub is_volatile: bool,
}

/// A resolved invocation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedMethod {
    pub handle: MethodHandle,
    pub declaring_class: ClassHandle,
    pub declaring_is_interface: bool,
    /// Address of the slot holding the method's current entry point.
    pub entry_slot: u64,
    /// Offset of the method's entry in its class vtable.
    pub vtable_offset: i32,
    pub class_initialized: bool,
}

/// A loadable constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    /// Address of the VM slot holding the interned string.
    String(u64),
    /// Address of the VM slot holding the class object.
    Class(u64),
}

/// Runtime helpers reachable from generated code.
///
/// Argument lists follow the variant docs; class and method handles travel as
/// 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Helper {
    /// `(class, instance_size: i32) -> ref`; a size of 0 makes the helper read it from the class.
    NewObject,
    /// `(array_class, length: i32) -> ref`
    NewArray,
    /// `(array_class, dims: i32, counts: *const u64) -> ref`; each count sits in the
    /// low half of an 8-byte slot, outermost dimension first.
    NewMultiArray,
    /// `(obj)`
    MonitorEnter,
    /// `(obj)`
    MonitorExit,
    /// `(class)`
    MonitorEnterStatic,
    /// `(class)`
    MonitorExitStatic,
    /// `(exception)`, does not return.
    Throw,
    ThrowNullPointer,
    /// `(index: i32)`
    ThrowArrayIndex,
    ThrowArithmetic,
    /// `(cp: i32, opcode: i32)`
    ThrowLinkingError,
    /// `(obj, class)`, throws on failure.
    CheckCast,
    /// `(obj, class) -> i32`
    InstanceOf,
    /// `(array, value)`
    ArrayStoreCheck,
    /// `(class)`
    ClassInit,
    /// `(obj, interface_class) -> vtable`
    InterfaceVtable,
    /// `(cp: i32, array_of: i32) -> class`; with `array_of` set, the array class
    /// whose elements are the named class.
    ResolveClass,
    /// `(kind: i32, cp: i32, receiver) -> code address`
    ResolveMethod,
    /// `(cp: i32, is_static: i32) -> field offset or static address`
    ResolveField,
    GcSafepoint,
    /// `(method)`
    MethodEntry,
    /// `(method, retval: *const u64)`
    MethodExit,
}

impl Helper {
    pub const ALL: [Helper; 23] = [
        Helper::NewObject,
        Helper::NewArray,
        Helper::NewMultiArray,
        Helper::MonitorEnter,
        Helper::MonitorExit,
        Helper::MonitorEnterStatic,
        Helper::MonitorExitStatic,
        Helper::Throw,
        Helper::ThrowNullPointer,
        Helper::ThrowArrayIndex,
        Helper::ThrowArithmetic,
        Helper::ThrowLinkingError,
        Helper::CheckCast,
        Helper::InstanceOf,
        Helper::ArrayStoreCheck,
        Helper::ClassInit,
        Helper::InterfaceVtable,
        Helper::ResolveClass,
        Helper::ResolveMethod,
        Helper::ResolveField,
        Helper::GcSafepoint,
        Helper::MethodEntry,
        Helper::MethodExit,
    ];

    /// Helpers that never return to the caller.
    pub fn is_noreturn(self) -> bool {
        matches!(
            self,
            Helper::Throw
                | Helper::ThrowNullPointer
                | Helper::ThrowArrayIndex
                | Helper::ThrowArithmetic
                | Helper::ThrowLinkingError
        )
    }
}

/// Object and array layout constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectLayout {
    /// Offset of the vtable pointer within an object.
    pub vtable_offset: i32,
    pub array_length_offset: i32,
    /// Offset of element 0 within an array.
    pub array_elems_offset: i32,
    /// Base of the vtable area when vtable pointers are stored as 32-bit offsets.
    pub vtable_base: Option<u64>,
}

impl Default for ObjectLayout {
    fn default() -> Self {
        Self {
            vtable_offset: 0,
            array_length_offset: 8,
            array_elems_offset: 16,
            vtable_base: None,
        }
    }
}

/// Compressed reference mode: heap refs are 32-bit offsets from `heap_base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedRefs {
    pub heap_base: u64,
}

/// Addresses of the byte flags the VM sets when a JVMTI agent wants events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JvmtiFlags {
    pub method_entry: Option<u64>,
    pub method_exit: Option<u64>,
}

/// Bridge between JET and the embedding VM.
pub trait VmAdaptor {
    fn resolve_class(&self, cp: u16) -> Option<ClassHandle>;

    /// Array class whose elements are of the class named by `cp`.
    fn resolve_array_class(&self, cp: u16) -> Option<ClassHandle>;

    fn primitive_array_class(&self, elem: JType) -> ClassHandle;

    fn class_is_initialized(&self, class: ClassHandle) -> bool;

    fn instance_size(&self, class: ClassHandle) -> u32;

    fn resolve_field(&self, cp: u16, is_static: bool) -> Option<FieldInfo>;

    /// Field type from the symbolic reference; available even when resolution fails.
    fn field_type(&self, cp: u16) -> Option<JType>;

    fn resolve_method(&self, kind: InvokeKind, cp: u16) -> Option<ResolvedMethod>;

    /// Declared argument and return types of the method named by `cp`.
    fn method_signature(&self, cp: u16) -> Option<(Vec<JType>, JType)>;

    fn constant(&self, cp: u16) -> Option<Constant>;

    fn helper(&self, helper: Helper) -> u64;

    fn object_layout(&self) -> ObjectLayout {
        ObjectLayout::default()
    }

    fn compressed_refs(&self) -> Option<CompressedRefs> {
        None
    }

    /// Defer symbolic resolution to run time.
    fn lazy_resolution(&self) -> bool {
        false
    }

    fn jvmti_flags(&self) -> JvmtiFlags {
        JvmtiFlags::default()
    }

    /// Address of the 32-bit word that is nonzero while a safepoint is requested.
    fn safepoint_flag(&self) -> Option<u64> {
        None
    }

    /// Address of the back-edge profiling counter of `method`.
    fn backedge_counter(&self, _method: MethodHandle) -> Option<u64> {
        None
    }

    /// Bit pattern of null held in registers.
    fn managed_null(&self) -> u64 {
        self.compressed_refs().map(|c| c.heap_base).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(desc: &str, is_static: bool) -> MethodInfo {
        MethodInfo {
            class_name: "Foo".into(),
            name: "f".into(),
            descriptor: desc.into(),
            flags: MethodFlags {
                is_static,
                is_synchronized: false,
            },
            handle: MethodHandle(1),
            class: ClassHandle(2),
            max_stack: 4,
            max_locals: 4,
            code: vec![],
            handlers: vec![],
        }
    }

    #[test]
    fn test_arg_types_include_this() {
        let m = method("(JB)I", false);
        assert_eq!(m.arg_types(), vec![JType::Ref, JType::I64, JType::I32]);
        assert_eq!(m.ret_type(), JType::I32);
        assert_eq!(m.in_slots(), 4);
        assert_eq!(m.full_name(), "Foo.f(JB)I");
    }

    #[test]
    fn test_static_method_sig() {
        let m = method("(D)Z", true);
        assert_eq!(m.arg_types(), vec![JType::F64]);
        assert_eq!(m.ret_type(), JType::I32);
        assert_eq!(m.in_slots(), 2);
    }
}
