//! A VM collaborator backed by an assembled module.
//!
//! Every handle and address is a pure function of declaration order, so generated
//! code for a given source is reproducible byte for byte.

use hashbrown::HashSet;

use super::{CpEntry, Module};
use crate::core::jtype::{parse_method_descriptor, JType};
use crate::core::method::{
    ClassHandle, CompressedRefs, Constant, FieldInfo, Helper, InvokeKind, JvmtiFlags,
    MethodHandle, ObjectLayout, ResolvedMethod, VmAdaptor,
};

pub const HELPER_BASE: u64 = 0x7000_0000_0000;
pub const ENTRY_SLOTS: u64 = 0x6000_0000_0000;
pub const STATICS: u64 = 0x5000_0000_0000;
pub const CONST_SLOTS: u64 = 0x4000_0000_0000;
pub const JVMTI_ENTRY_FLAG: u64 = 0x3000_0000_0000;
pub const JVMTI_EXIT_FLAG: u64 = 0x3000_0000_0008;
pub const SAFEPOINT_FLAG: u64 = 0x3000_0000_0010;
pub const BACKEDGE_COUNTERS: u64 = 0x3000_0001_0000;

/// Offset of the first instance field when none is given.
pub(super) const FIELD_START: i32 = 16;
/// Offset of the first vtable entry when none is given.
pub(super) const VTABLE_START: i32 = 0x40;

const CLASS_BASE: u64 = 0x10_0000;
const DESC_CLASS_BASE: u64 = 0x20_0000;
const PRIM_ARRAY_BASE: u64 = 0x30_0000;

pub(super) fn class_handle(idx: usize) -> ClassHandle {
    ClassHandle(CLASS_BASE + 0x100 * idx as u64)
}

pub(super) fn method_handle(idx: usize) -> MethodHandle {
    MethodHandle(idx as u64 + 1)
}

/// Stub runtime answering resolution queries from a [`Module`].
#[derive(Debug, Clone)]
pub struct StubRuntime<'m> {
    module: &'m Module,
    unresolved: HashSet<String>,
    lazy: bool,
    compressed: Option<CompressedRefs>,
    jvmti: bool,
    safepoints: bool,
    layout: ObjectLayout,
}

impl<'m> StubRuntime<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            unresolved: HashSet::new(),
            lazy: false,
            compressed: None,
            jvmti: false,
            safepoints: false,
            layout: ObjectLayout::default(),
        }
    }

    /// Make resolution of a class (`Foo`) or member (`Foo.bar`) fail.
    pub fn with_unresolved(mut self, name: &str) -> Self {
        self.unresolved.insert(name.to_string());
        self
    }

    pub fn with_lazy_resolution(mut self, on: bool) -> Self {
        self.lazy = on;
        self
    }

    pub fn with_compressed_refs(mut self, heap_base: Option<u64>) -> Self {
        self.compressed = heap_base.map(|heap_base| CompressedRefs { heap_base });
        self
    }

    pub fn with_jvmti(mut self, on: bool) -> Self {
        self.jvmti = on;
        self
    }

    /// Provide a safepoint flag and back-edge counters.
    pub fn with_safepoints(mut self, on: bool) -> Self {
        self.safepoints = on;
        self
    }

    pub fn with_object_layout(mut self, layout: ObjectLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn helper_addr(helper: Helper) -> u64 {
        let idx = Helper::ALL.iter().position(|&h| h == helper).unwrap_or(0);
        HELPER_BASE + 0x10 * idx as u64
    }

    /// Helper living at `addr`, if any.
    pub fn helper_at(addr: u64) -> Option<Helper> {
        let off = addr.checked_sub(HELPER_BASE)?;
        if off % 0x10 != 0 {
            return None;
        }
        Helper::ALL.get((off / 0x10) as usize).copied()
    }

    /// Entry slot of the method declared `idx`-th.
    pub fn entry_slot(idx: usize) -> u64 {
        ENTRY_SLOTS + 8 * idx as u64
    }

    fn class_by_name(&self, name: &str) -> Option<(usize, ClassHandle)> {
        if self.unresolved.contains(name) {
            return None;
        }
        let idx = self.module.class_index(name)?;
        Some((idx, class_handle(idx)))
    }

    fn class_idx_of(&self, class: ClassHandle) -> Option<usize> {
        let off = class.0.checked_sub(CLASS_BASE)?;
        let idx = (off / 0x100) as usize;
        (off % 0x100 == 0 && idx < self.module.classes.len()).then_some(idx)
    }

    fn class_name(&self, cp: u16) -> Option<&'m str> {
        match self.module.pool.get(cp)? {
            CpEntry::Class(name) => Some(name.as_str()),
            _ => None,
        }
    }

    fn member(&self, cp: u16) -> Option<(&'m str, &'m str, &'m str)> {
        match self.module.pool.get(cp)? {
            CpEntry::Field { class, name, desc } | CpEntry::Method { class, name, desc } => {
                Some((class.as_str(), name.as_str(), desc.as_str()))
            }
            _ => None,
        }
    }

    fn member_blocked(&self, class: &str, name: &str) -> bool {
        self.unresolved.contains(class) || self.unresolved.contains(&format!("{class}.{name}"))
    }
}

impl VmAdaptor for StubRuntime<'_> {
    fn resolve_class(&self, cp: u16) -> Option<ClassHandle> {
        let name = self.class_name(cp)?;
        if name.starts_with('[') && !self.unresolved.contains(name) {
            return Some(ClassHandle(DESC_CLASS_BASE + 0x100 * cp as u64));
        }
        self.class_by_name(name).map(|(_, h)| h)
    }

    fn resolve_array_class(&self, cp: u16) -> Option<ClassHandle> {
        self.resolve_class(cp).map(|h| ClassHandle(h.0 + 0x80))
    }

    fn primitive_array_class(&self, elem: JType) -> ClassHandle {
        let tag = match elem {
            JType::Bool => 4,
            JType::U16 => 5,
            JType::F32 => 6,
            JType::F64 => 7,
            JType::I8 => 8,
            JType::I16 => 9,
            JType::I32 => 10,
            _ => 11,
        };
        ClassHandle(PRIM_ARRAY_BASE + 0x100 * tag)
    }

    fn class_is_initialized(&self, class: ClassHandle) -> bool {
        self.class_idx_of(class)
            .map(|i| self.module.classes[i].initialized)
            .unwrap_or(true)
    }

    fn instance_size(&self, class: ClassHandle) -> u32 {
        let Some(idx) = self.class_idx_of(class) else {
            return FIELD_START as u32;
        };
        let decl = &self.module.classes[idx];
        if decl.size != 0 {
            return decl.size;
        }
        let end = self
            .module
            .fields
            .iter()
            .filter(|f| f.class == decl.name && !f.is_static)
            .map(|f| f.offset + 8)
            .max()
            .unwrap_or(FIELD_START);
        end as u32
    }

    fn resolve_field(&self, cp: u16, is_static: bool) -> Option<FieldInfo> {
        let (class, name, desc) = self.member(cp)?;
        if self.member_blocked(class, name) {
            return None;
        }
        let (class_idx, handle) = self.class_by_name(class)?;
        let idx = self
            .module
            .fields
            .iter()
            .position(|f| f.class == class && f.name == name && f.desc == desc)?;
        let f = &self.module.fields[idx];
        if f.is_static != is_static {
            return None;
        }
        Some(FieldInfo {
            jt: JType::from_descriptor_char(*desc.as_bytes().first()?)?,
            offset: f.offset,
            static_addr: STATICS + 8 * idx as u64,
            class: handle,
            class_initialized: self.module.classes[class_idx].initialized,
            is_volatile: f.is_volatile,
        })
    }

    fn field_type(&self, cp: u16) -> Option<JType> {
        match self.module.pool.get(cp)? {
            CpEntry::Field { desc, .. } => JType::from_descriptor_char(*desc.as_bytes().first()?),
            _ => None,
        }
    }

    fn resolve_method(&self, _kind: InvokeKind, cp: u16) -> Option<ResolvedMethod> {
        let (class, name, desc) = self.member(cp)?;
        if self.member_blocked(class, name) {
            return None;
        }
        let (class_idx, handle) = self.class_by_name(class)?;
        let idx = self
            .module
            .decls
            .iter()
            .position(|d| d.class == class && d.name == name && d.desc == desc)?;
        let decl = &self.module.classes[class_idx];
        Some(ResolvedMethod {
            handle: method_handle(idx),
            declaring_class: handle,
            declaring_is_interface: decl.is_interface,
            entry_slot: Self::entry_slot(idx),
            vtable_offset: self.module.decls[idx].vtable_offset,
            class_initialized: decl.initialized,
        })
    }

    fn method_signature(&self, cp: u16) -> Option<(Vec<JType>, JType)> {
        match self.module.pool.get(cp)? {
            CpEntry::Method { desc, .. } => parse_method_descriptor(desc),
            _ => None,
        }
    }

    fn constant(&self, cp: u16) -> Option<Constant> {
        Some(match self.module.pool.get(cp)? {
            CpEntry::Int(v) => Constant::Int(*v),
            CpEntry::Float(v) => Constant::Float(*v),
            CpEntry::Long(v) => Constant::Long(*v),
            CpEntry::Double(v) => Constant::Double(*v),
            CpEntry::String(_) => Constant::String(CONST_SLOTS + 8 * cp as u64),
            CpEntry::Class(name) => {
                self.class_by_name(name)?;
                Constant::Class(CONST_SLOTS + 8 * cp as u64)
            }
            _ => return None,
        })
    }

    fn helper(&self, helper: Helper) -> u64 {
        Self::helper_addr(helper)
    }

    fn object_layout(&self) -> ObjectLayout {
        self.layout
    }

    fn compressed_refs(&self) -> Option<CompressedRefs> {
        self.compressed
    }

    fn lazy_resolution(&self) -> bool {
        self.lazy
    }

    fn jvmti_flags(&self) -> JvmtiFlags {
        if self.jvmti {
            JvmtiFlags {
                method_entry: Some(JVMTI_ENTRY_FLAG),
                method_exit: Some(JVMTI_EXIT_FLAG),
            }
        } else {
            JvmtiFlags::default()
        }
    }

    fn safepoint_flag(&self) -> Option<u64> {
        self.safepoints.then_some(SAFEPOINT_FLAG)
    }

    fn backedge_counter(&self, method: MethodHandle) -> Option<u64> {
        self.safepoints
            .then_some(BACKEDGE_COUNTERS + 4 * method.0)
    }
}
