// File: src/heap.rs
//
// Object heap and mark-sweep garbage collector for the Lox VM.
// The heap owns everything the collector needs to see: the object arena,
// the value stack, the call frames, the open-upvalue list, the interned
// string set, and the native registry. The compiler registers its
// in-progress functions in `compiler_roots` so a collection is safe at
// any allocation point, including mid-compile.

use ahash::RandomState;
use std::hash::BuildHasher;

use crate::object::{
    BoundMethod, CallFrame, Class, Closure, Function, Instance, Native, NativeFn, Obj, ObjRef,
    StrObj, Upvalue, UpvalueState,
};
use crate::table::Table;
use crate::value::{number_to_string, Value};

const GC_FIRST_THRESHOLD: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

struct Slot {
    marked: bool,
    // Footprint recorded at allocation; later growth is not re-accounted,
    // which only makes the trigger threshold slightly conservative.
    size: usize,
    obj: Obj,
}

/// The all-objects store. Every live allocation is resident in a slot;
/// sweeping walks the slots, so nothing can leak out of the collector's
/// view.
pub struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    bytes_allocated: usize,
}

impl Arena {
    fn new() -> Arena {
        Arena { slots: Vec::new(), free: Vec::new(), bytes_allocated: 0 }
    }

    fn alloc(&mut self, obj: Obj) -> ObjRef {
        let size = obj.heap_size();
        self.bytes_allocated += size;
        let slot = Slot { marked: false, size, obj };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(slot));
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    fn release(&mut self, index: usize) {
        if let Some(slot) = self.slots[index].take() {
            self.bytes_allocated -= slot.size.min(self.bytes_allocated);
            self.free.push(index as u32);
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.0 as usize] {
            Some(slot) => &slot.obj,
            None => panic!("ICE: dangling object handle {:?}", r),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.0 as usize] {
            Some(slot) => &mut slot.obj,
            None => panic!("ICE: dangling object handle {:?}", r),
        }
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        match &self.slots[r.0 as usize] {
            Some(slot) => slot.marked,
            None => false,
        }
    }

    fn set_marked(&mut self, r: ObjRef, marked: bool) {
        if let Some(slot) = &mut self.slots[r.0 as usize] {
            slot.marked = marked;
        }
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn refs(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| ObjRef(i as u32)))
    }

    pub fn string(&self, r: ObjRef) -> &StrObj {
        match self.get(r) {
            Obj::String(s) => s,
            _ => panic!("ICE: expected string object"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => panic!("ICE: expected function object"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut Function {
        match self.get_mut(r) {
            Obj::Function(f) => f,
            _ => panic!("ICE: expected function object"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => panic!("ICE: expected closure object"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut Closure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => panic!("ICE: expected closure object"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &Upvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("ICE: expected upvalue object"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("ICE: expected upvalue object"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &Class {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => panic!("ICE: expected class object"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut Class {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => panic!("ICE: expected class object"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &Instance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => panic!("ICE: expected instance object"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut Instance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => panic!("ICE: expected instance object"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethod {
        match self.get(r) {
            Obj::BoundMethod(b) => b,
            _ => panic!("ICE: expected bound method object"),
        }
    }

    pub fn native(&self, r: ObjRef) -> &Native {
        match self.get(r) {
            Obj::Native(n) => n,
            _ => panic!("ICE: expected native object"),
        }
    }
}

pub struct Heap {
    pub arena: Arena,
    /// Interned strings; traced weakly (unmarked keys are dropped
    /// between the mark and sweep phases).
    pub strings: Table,
    /// Native registry, keyed by interned name. A strong root.
    pub natives: Table,
    pub init_string: Option<ObjRef>,
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    /// Open upvalues sorted by descending stack slot.
    pub open_upvalues: Vec<ObjRef>,
    /// Functions currently being compiled; marked on every collection.
    pub compiler_roots: Vec<ObjRef>,
    pub enabled: bool,
    stress: bool,
    gray: Vec<ObjRef>,
    next_gc: usize,
    collections: usize,
    hasher: RandomState,
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            arena: Arena::new(),
            strings: Table::new(),
            natives: Table::new(),
            init_string: None,
            stack: Vec::new(),
            frames: Vec::new(),
            open_upvalues: Vec::new(),
            compiler_roots: Vec::new(),
            enabled: false,
            stress: std::env::var("LOX_STRESS_GC").is_ok(),
            gray: Vec::new(),
            next_gc: GC_FIRST_THRESHOLD,
            collections: 0,
            hasher: RandomState::new(),
        }
    }

    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    pub fn collections(&self) -> usize {
        self.collections
    }

    pub fn hash_str(&self, chars: &str) -> u32 {
        self.hasher.hash_one(chars) as u32
    }

    pub fn str_hash(&self, r: ObjRef) -> u32 {
        self.arena.string(r).hash
    }

    pub fn string_chars(&self, r: ObjRef) -> &str {
        &self.arena.string(r).chars
    }

    /// Interns a borrowed string, copying it only when it is new.
    pub fn copy_string(&mut self, chars: &str) -> ObjRef {
        let hash = self.hash_str(chars);
        if let Some(existing) = self.strings.find_string(&self.arena, chars, hash) {
            return existing;
        }
        self.intern_new(chars.to_owned(), hash)
    }

    /// Interns an owned string; a duplicate buffer is simply dropped.
    pub fn take_string(&mut self, chars: String) -> ObjRef {
        let hash = self.hash_str(&chars);
        if let Some(existing) = self.strings.find_string(&self.arena, &chars, hash) {
            return existing;
        }
        self.intern_new(chars, hash)
    }

    fn intern_new(&mut self, chars: String, hash: u32) -> ObjRef {
        self.maybe_collect();
        let r = self.arena.alloc(Obj::String(StrObj { chars, hash }));
        // Keep the fresh string reachable while the table takes it.
        self.stack.push(Value::Obj(r));
        self.strings.set(r, hash, Value::Nil);
        self.stack.pop();
        r
    }

    pub fn new_function(&mut self) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Function(Function {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk: crate::bytecode::Chunk::new(),
        }))
    }

    pub fn new_native(&mut self, function: NativeFn, arity: u8, name: ObjRef) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Native(Native { function, arity, name }))
    }

    pub fn new_closure(&mut self, function: ObjRef) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Closure(Closure { function, upvalues: Vec::new() }))
    }

    pub fn new_upvalue(&mut self, slot: usize) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Upvalue(Upvalue { state: UpvalueState::Open(slot) }))
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Class(Class { name, methods: Table::new() }))
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::Instance(Instance { class, fields: Table::new() }))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.maybe_collect();
        self.arena.alloc(Obj::BoundMethod(BoundMethod { receiver, method }))
    }

    /// Every allocation funnels through here first, so a collection can
    /// happen at any allocation point. Callers must keep their own
    /// temporaries reachable (usually by pushing them on the stack).
    pub fn maybe_collect(&mut self) {
        if !self.enabled {
            return;
        }
        if self.stress || self.arena.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
    }

    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.trace_references();
        self.strings.remove_unmarked_keys(&self.arena);
        self.sweep();
        self.next_gc =
            (self.arena.bytes_allocated * GC_HEAP_GROW_FACTOR).max(GC_FIRST_THRESHOLD);
        self.collections += 1;
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.mark_value(value);
        }

        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.mark_object(closure);
        }

        for i in 0..self.open_upvalues.len() {
            let upvalue = self.open_upvalues[i];
            self.mark_object(upvalue);
        }

        for i in 0..self.compiler_roots.len() {
            let function = self.compiler_roots[i];
            self.mark_object(function);
        }

        let natives: Vec<(ObjRef, Value)> = self.natives.iter().collect();
        for (key, value) in natives {
            self.mark_object(key);
            self.mark_value(value);
        }

        if let Some(init) = self.init_string {
            self.mark_object(init);
        }
    }

    fn trace_references(&mut self) {
        while let Some(gray) = self.gray.pop() {
            let children = self.children_of(gray);
            for child in children {
                self.mark_value(child);
            }
        }
    }

    fn children_of(&self, r: ObjRef) -> Vec<Value> {
        match self.arena.get(r) {
            Obj::String(_) | Obj::Native(_) => Vec::new(),
            Obj::Function(function) => {
                let mut out: Vec<Value> = function.chunk.constants().to_vec();
                if let Some(name) = function.name {
                    out.push(Value::Obj(name));
                }
                out
            }
            Obj::Closure(closure) => {
                let mut out = vec![Value::Obj(closure.function)];
                out.extend(closure.upvalues.iter().map(|&u| Value::Obj(u)));
                out
            }
            Obj::Upvalue(upvalue) => match upvalue.state {
                UpvalueState::Open(_) => Vec::new(),
                UpvalueState::Closed(value) => vec![value],
            },
            Obj::Class(class) => {
                let mut out = vec![Value::Obj(class.name)];
                for (key, value) in class.methods.iter() {
                    out.push(Value::Obj(key));
                    out.push(value);
                }
                out
            }
            Obj::Instance(instance) => {
                let mut out = vec![Value::Obj(instance.class)];
                for (key, value) in instance.fields.iter() {
                    out.push(Value::Obj(key));
                    out.push(value);
                }
                out
            }
            Obj::BoundMethod(bound) => {
                vec![bound.receiver, Value::Obj(bound.method)]
            }
        }
    }

    fn sweep(&mut self) {
        for index in 0..self.arena.slots.len() {
            let marked = match &self.arena.slots[index] {
                Some(slot) => slot.marked,
                None => continue,
            };
            if marked {
                if let Some(slot) = &mut self.arena.slots[index] {
                    slot.marked = false;
                }
            } else {
                self.arena.release(index);
            }
        }
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if self.arena.is_marked(r) {
            return;
        }
        self.arena.set_marked(r, true);
        self.gray.push(r);
    }

    /// Human-readable rendering used by `print`, the REPL, and the
    /// disassembler.
    pub fn format_value(&self, value: Value) -> String {
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => if b { "true" } else { "false" }.to_string(),
            Value::Number(n) => number_to_string(n),
            Value::Obj(r) => self.format_object(r),
        }
    }

    fn format_object(&self, r: ObjRef) -> String {
        match self.arena.get(r) {
            Obj::String(s) => s.chars.clone(),
            Obj::Function(f) => format!("<raw-fn {}>", self.name_or_script(f.name)),
            Obj::Native(n) => format!("<native-fn {}>", self.string_chars(n.name)),
            Obj::Closure(c) => {
                let function = self.arena.function(c.function);
                format!("<fn {}>", self.name_or_script(function.name))
            }
            Obj::BoundMethod(b) => {
                let closure = self.arena.closure(b.method);
                let function = self.arena.function(closure.function);
                format!("<fn {}>", self.name_or_script(function.name))
            }
            Obj::Upvalue(_) => "<upvalue>".to_string(),
            Obj::Class(c) => self.string_chars(c.name).to_string(),
            Obj::Instance(i) => {
                let class = self.arena.class(i.class);
                format!("{} instance", self.string_chars(class.name))
            }
        }
    }

    fn name_or_script(&self, name: Option<ObjRef>) -> &str {
        match name {
            Some(r) => self.string_chars(r),
            None => "script",
        }
    }
}

impl Default for Heap {
    fn default() -> Heap {
        Heap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_intern_to_one_object() {
        let mut heap = Heap::new();
        let a = heap.copy_string("hello");
        let b = heap.copy_string("hello");
        let c = heap.take_string("hello".to_string());
        let other = heap.copy_string("world");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, other);
    }

    #[test]
    fn unreferenced_strings_are_collected_weakly() {
        let mut heap = Heap::new();
        heap.enabled = true;
        let kept = heap.copy_string("kept");
        heap.stack.push(Value::Obj(kept));
        heap.copy_string("garbage");

        assert_eq!(heap.arena.object_count(), 2);
        heap.collect_garbage();
        assert_eq!(heap.arena.object_count(), 1);

        // The intern set no longer knows the dead string; re-interning
        // allocates a fresh object.
        let hash = heap.hash_str("garbage");
        assert!(heap.strings.find_string(&heap.arena, "garbage", hash).is_none());
        let kept_hash = heap.hash_str("kept");
        assert_eq!(heap.strings.find_string(&heap.arena, "kept", kept_hash), Some(kept));
    }

    #[test]
    fn closed_upvalues_keep_their_value_alive() {
        let mut heap = Heap::new();
        heap.enabled = true;
        let s = heap.copy_string("captured");
        let upvalue = heap.new_upvalue(0);
        match heap.arena.get_mut(upvalue) {
            Obj::Upvalue(u) => u.state = UpvalueState::Closed(Value::Obj(s)),
            _ => unreachable!(),
        }
        heap.open_upvalues.push(upvalue);

        heap.collect_garbage();
        assert_eq!(heap.string_chars(s), "captured");
        assert_eq!(heap.arena.object_count(), 2);
    }

    #[test]
    fn stress_mode_collects_on_every_allocation() {
        let mut heap = Heap::new();
        heap.enabled = true;
        heap.set_stress(true);
        let before = heap.collections();
        heap.copy_string("one");
        heap.copy_string("two");
        assert!(heap.collections() >= before + 2);
    }
}
