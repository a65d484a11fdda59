//! Line-oriented parser for the jasm format.

use hashbrown::HashMap;

use super::stub::{class_handle, method_handle, FIELD_START, VTABLE_START};
use super::{ClassDecl, CpEntry, FieldDecl, JasmError, MethodDecl, Module};
use crate::core::bytecode::*;
use crate::core::jtype::{parse_method_descriptor, JType};
use crate::core::method::{ExceptionHandler, MethodFlags, MethodInfo};

/// Operand stack limit of methods without `.limit stack`.
const DEFAULT_MAX_STACK: u16 = 16;

/// Assemble `text` into a module.
pub fn parse(text: &str) -> Result<Module, JasmError> {
    let mut parser = Parser {
        module: Module::default(),
    };
    let mut lines = text.lines().enumerate().map(|(i, l)| (i + 1, l));
    while let Some((line, raw)) = lines.next() {
        let toks = tokenize(raw, line)?;
        let Some(first) = toks.first() else {
            continue;
        };
        match first.text.as_str() {
            ".class" => parser.class_decl(&toks[1..], line)?,
            ".field" => parser.field_decl(&toks[1..], line, false)?,
            ".static" => parser.field_decl(&toks[1..], line, true)?,
            ".method" => parser.method_decl(&toks[1..], line)?,
            "method" => parser.method_body(&toks[1..], line, &mut lines)?,
            other => return Err(syntax(line, format!("unexpected '{other}' outside a method"))),
        }
    }
    log::debug!(
        "jasm: {} methods, {} constant pool entries",
        parser.module.methods.len(),
        parser.module.pool.len()
    );
    Ok(parser.module)
}

fn syntax(line: usize, msg: impl Into<String>) -> JasmError {
    JasmError::Syntax {
        line,
        msg: msg.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tok {
    text: String,
    quoted: bool,
}

fn tokenize(raw: &str, line: usize) -> Result<Vec<Tok>, JasmError> {
    let mut toks = Vec::new();
    let mut chars = raw.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c == ';' {
            break;
        }
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some(e @ ('"' | '\\')) => text.push(e),
                        _ => return Err(syntax(line, "bad escape in string")),
                    },
                    Some(ch) => text.push(ch),
                    None => return Err(syntax(line, "unterminated string")),
                }
            }
            toks.push(Tok { text, quoted: true });
            continue;
        }
        let mut text = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() || ch == ';' {
                break;
            }
            text.push(ch);
            chars.next();
        }
        toks.push(Tok {
            text,
            quoted: false,
        });
    }
    Ok(toks)
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.strip_suffix(['L', 'l']).unwrap_or(s);
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if neg { v.wrapping_neg() } else { v })
}

fn parse_float(s: &str) -> Option<f64> {
    s.parse::<f64>()
        .ok()
        .or_else(|| s.strip_suffix(['f', 'F', 'd', 'D'])?.parse().ok())
}

fn is_hex(s: &str) -> bool {
    let s = s.strip_prefix('-').unwrap_or(s);
    s.starts_with("0x") || s.starts_with("0X")
}

fn looks_float(s: &str) -> bool {
    if is_hex(s) {
        return false;
    }
    let lower = s.to_ascii_lowercase();
    let bare = lower.strip_prefix('-').unwrap_or(&lower);
    s.contains('.')
        || s.contains(['e', 'E'])
        || bare.starts_with("inf")
        || bare.starts_with("nan")
        || s.ends_with(['f', 'F', 'd', 'D'])
}

/// Split `Class.name(desc)` or `Class.name`.
fn split_member(s: &str, line: usize) -> Result<(String, String, Option<String>), JasmError> {
    let (head, desc) = match s.find('(') {
        Some(i) => (&s[..i], Some(s[i..].to_string())),
        None => (s, None),
    };
    let dot = head
        .rfind('.')
        .ok_or_else(|| syntax(line, format!("expected Class.member, found '{s}'")))?;
    let (class, name) = (&head[..dot], &head[dot + 1..]);
    if class.is_empty() || name.is_empty() {
        return Err(syntax(line, format!("expected Class.member, found '{s}'")));
    }
    Ok((class.to_string(), name.to_string(), desc))
}

fn arg<'t>(args: &'t [Tok], i: usize, line: usize, what: &str) -> Result<&'t Tok, JasmError> {
    args.get(i)
        .ok_or_else(|| syntax(line, format!("missing {what}")))
}

fn int_arg(args: &[Tok], i: usize, line: usize, what: &str) -> Result<i64, JasmError> {
    let t = arg(args, i, line, what)?;
    parse_int(&t.text).ok_or_else(|| syntax(line, format!("bad {what} '{}'", t.text)))
}

fn atype_of(name: &str) -> Option<u8> {
    Some(match name {
        "boolean" => 4,
        "char" => 5,
        "float" => 6,
        "double" => 7,
        "byte" => 8,
        "short" => 9,
        "int" => 10,
        "long" => 11,
        _ => return None,
    })
}

/// Local slot and slot count touched by a local access opcode.
fn local_width(op: u8) -> usize {
    const WIDE: [bool; 5] = [false, true, false, true, false];
    match op {
        ILOAD..=ALOAD => WIDE[(op - ILOAD) as usize] as usize + 1,
        ISTORE..=ASTORE => WIDE[(op - ISTORE) as usize] as usize + 1,
        _ => 1,
    }
}

/// Implicit local of `xload_n`/`xstore_n` and its width.
fn short_local(op: u8) -> Option<(usize, usize)> {
    let (k, base) = match op {
        ILOAD_0..=ALOAD_3 => (op - ILOAD_0, ILOAD),
        ISTORE_0..=ASTORE_3 => (op - ISTORE_0, ISTORE),
        _ => return None,
    };
    Some(((k % 4) as usize, local_width(base + k / 4)))
}

struct Fixup {
    at: usize,
    pc: u32,
    label: String,
    wide: bool,
    line: usize,
}

struct Catch {
    from: String,
    to: String,
    handler: String,
    class: Option<u16>,
    line: usize,
}

#[derive(Default)]
struct Body {
    code: Vec<u8>,
    labels: HashMap<String, u32>,
    fixups: Vec<Fixup>,
    catches: Vec<Catch>,
    max_stack: Option<u16>,
    max_locals: Option<u16>,
    locals_used: usize,
}

impl Body {
    fn pc(&self) -> u32 {
        self.code.len() as u32
    }

    fn u2(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn s4(&mut self, v: i32) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    fn note_local(&mut self, idx: usize, width: usize) {
        self.locals_used = self.locals_used.max(idx + width);
    }

    fn branch(&mut self, label: &Tok, pc: u32, wide: bool, line: usize) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            pc,
            label: label.text.clone(),
            wide,
            line,
        });
        if wide {
            self.s4(0);
        } else {
            self.u2(0);
        }
    }

    fn label(&self, name: &str, line: usize) -> Result<u32, JasmError> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| JasmError::UndefinedLabel {
                line,
                label: name.to_string(),
            })
    }

    fn resolve(&mut self) -> Result<(), JasmError> {
        for f in std::mem::take(&mut self.fixups) {
            let target = self.label(&f.label, f.line)?;
            let off = target as i64 - f.pc as i64;
            if f.wide {
                self.code[f.at..f.at + 4].copy_from_slice(&(off as i32).to_be_bytes());
            } else {
                let off = i16::try_from(off).map_err(|_| JasmError::BranchRange {
                    line: f.line,
                    label: f.label.clone(),
                })?;
                self.code[f.at..f.at + 2].copy_from_slice(&off.to_be_bytes());
            }
        }
        Ok(())
    }
}

struct Parser {
    module: Module,
}

impl Parser {
    fn ensure_class(&mut self, name: &str) -> usize {
        if let Some(i) = self.module.class_index(name) {
            return i;
        }
        self.module.classes.push(ClassDecl {
            name: name.to_string(),
            is_interface: false,
            initialized: true,
            size: 0,
        });
        self.module.classes.len() - 1
    }

    fn class_decl(&mut self, args: &[Tok], line: usize) -> Result<(), JasmError> {
        let name = arg(args, 0, line, "class name")?.text.clone();
        let idx = self.ensure_class(&name);
        let mut i = 1;
        while i < args.len() {
            match args[i].text.as_str() {
                "interface" => self.module.classes[idx].is_interface = true,
                "uninit" => self.module.classes[idx].initialized = false,
                "size" => {
                    i += 1;
                    let size = int_arg(args, i, line, "size")?;
                    self.module.classes[idx].size = size as u32;
                }
                other => return Err(syntax(line, format!("unknown class attribute '{other}'"))),
            }
            i += 1;
        }
        Ok(())
    }

    fn field_decl(&mut self, args: &[Tok], line: usize, is_static: bool) -> Result<(), JasmError> {
        let (class, name, _) = split_member(&arg(args, 0, line, "field")?.text, line)?;
        let desc = arg(args, 1, line, "field descriptor")?.text.clone();
        if matches!(
            desc.bytes().next().and_then(JType::from_descriptor_char),
            None | Some(JType::Void)
        ) {
            return Err(syntax(line, format!("bad field descriptor '{desc}'")));
        }
        self.ensure_class(&class);
        let taken = self
            .module
            .fields
            .iter()
            .filter(|f| f.class == class && !f.is_static)
            .count();
        let mut field = FieldDecl {
            class,
            name,
            desc,
            is_static,
            offset: if is_static { 0 } else { FIELD_START + 8 * taken as i32 },
            is_volatile: false,
        };
        let mut i = 2;
        while i < args.len() {
            match args[i].text.as_str() {
                "volatile" => field.is_volatile = true,
                "offset" if !is_static => {
                    i += 1;
                    field.offset = int_arg(args, i, line, "offset")? as i32;
                }
                other => return Err(syntax(line, format!("unknown field attribute '{other}'"))),
            }
            i += 1;
        }
        self.module.fields.push(field);
        Ok(())
    }

    /// Declare a callable method; returns its index.
    fn declare_method(&mut self, class: &str, name: &str, desc: &str) -> usize {
        if let Some(i) = self
            .module
            .decls
            .iter()
            .position(|d| d.class == class && d.name == name && d.desc == desc)
        {
            return i;
        }
        self.ensure_class(class);
        let taken = self.module.decls.iter().filter(|d| d.class == class).count();
        self.module.decls.push(MethodDecl {
            class: class.to_string(),
            name: name.to_string(),
            desc: desc.to_string(),
            vtable_offset: VTABLE_START + 8 * taken as i32,
        });
        self.module.decls.len() - 1
    }

    fn method_decl(&mut self, args: &[Tok], line: usize) -> Result<(), JasmError> {
        let (class, name, desc) = split_member(&arg(args, 0, line, "method")?.text, line)?;
        let desc = desc
            .filter(|d| parse_method_descriptor(d).is_some())
            .ok_or_else(|| syntax(line, "bad method descriptor"))?;
        let idx = self.declare_method(&class, &name, &desc);
        match args.get(1).map(|t| t.text.as_str()) {
            None => {}
            Some("vtable") => {
                self.module.decls[idx].vtable_offset = int_arg(args, 2, line, "vtable offset")? as i32
            }
            Some(other) => return Err(syntax(line, format!("unknown method attribute '{other}'"))),
        }
        Ok(())
    }

    fn method_body<'s>(
        &mut self,
        args: &[Tok],
        line: usize,
        lines: &mut impl Iterator<Item = (usize, &'s str)>,
    ) -> Result<(), JasmError> {
        let mut flags = MethodFlags::default();
        let mut rest = args;
        while let Some(t) = rest.first() {
            match t.text.as_str() {
                "static" => flags.is_static = true,
                "synchronized" => flags.is_synchronized = true,
                _ => break,
            }
            rest = &rest[1..];
        }
        let (class, name, desc) = split_member(&arg(rest, 0, line, "method name")?.text, line)?;
        let desc = desc
            .filter(|d| parse_method_descriptor(d).is_some())
            .ok_or_else(|| syntax(line, "bad method descriptor"))?;
        let decl = self.declare_method(&class, &name, &desc);
        let class_idx = self.ensure_class(&class);

        let mut body = Body::default();
        let mut closed = false;
        let mut last = line;
        for (line, raw) in lines.by_ref() {
            last = line;
            let toks = tokenize(raw, line)?;
            let mut toks = toks.as_slice();
            while let Some(label) = toks.first().and_then(|t| t.text.strip_suffix(':')) {
                if body.labels.insert(label.to_string(), body.pc()).is_some() {
                    return Err(JasmError::DuplicateLabel {
                        line,
                        label: label.to_string(),
                    });
                }
                toks = &toks[1..];
            }
            let Some(first) = toks.first() else {
                continue;
            };
            match first.text.as_str() {
                "end" => {
                    closed = true;
                    break;
                }
                ".limit" => {
                    let v = int_arg(toks, 2, line, "limit")? as u16;
                    match arg(toks, 1, line, "limit kind")?.text.as_str() {
                        "stack" => body.max_stack = Some(v),
                        "locals" => body.max_locals = Some(v),
                        other => return Err(syntax(line, format!("unknown limit '{other}'"))),
                    }
                }
                ".catch" => {
                    let class = match toks.get(4).map(|t| t.text.as_str()) {
                        None | Some("any") => None,
                        Some(c) => Some(self.module.pool.intern(CpEntry::Class(c.to_string()))),
                    };
                    body.catches.push(Catch {
                        from: arg(toks, 1, line, "range start")?.text.clone(),
                        to: arg(toks, 2, line, "range end")?.text.clone(),
                        handler: arg(toks, 3, line, "handler")?.text.clone(),
                        class,
                        line,
                    });
                }
                _ => self.inst(&mut body, toks, line)?,
            }
        }
        if !closed {
            return Err(JasmError::Unterminated { line: last });
        }
        body.resolve()?;

        let mut handlers = Vec::with_capacity(body.catches.len());
        for c in &body.catches {
            handlers.push(ExceptionHandler {
                start_pc: body.label(&c.from, c.line)?,
                end_pc: body.label(&c.to, c.line)?,
                handler_pc: body.label(&c.handler, c.line)?,
                catch_type: c.class,
            });
        }

        let mut method = MethodInfo {
            class_name: class,
            name,
            descriptor: desc,
            flags,
            handle: method_handle(decl),
            class: class_handle(class_idx),
            max_stack: body.max_stack.unwrap_or(DEFAULT_MAX_STACK),
            max_locals: 0,
            code: body.code,
            handlers,
        };
        method.max_locals = body
            .max_locals
            .unwrap_or(body.locals_used.max(method.in_slots()) as u16);
        self.module.methods.push(method);
        Ok(())
    }

    fn constant(&mut self, args: &[Tok], wide: bool, line: usize) -> Result<u16, JasmError> {
        let t = arg(args, 0, line, "constant")?;
        let entry = if t.quoted {
            CpEntry::String(t.text.clone())
        } else if t.text == "class" {
            CpEntry::Class(arg(args, 1, line, "class name")?.text.clone())
        } else if looks_float(&t.text) {
            let v = parse_float(&t.text)
                .ok_or_else(|| syntax(line, format!("bad constant '{}'", t.text)))?;
            if wide {
                CpEntry::Double(v)
            } else {
                CpEntry::Float(v as f32)
            }
        } else {
            let v = parse_int(&t.text)
                .ok_or_else(|| syntax(line, format!("bad constant '{}'", t.text)))?;
            if wide {
                CpEntry::Long(v)
            } else {
                CpEntry::Int(
                    i32::try_from(v).map_err(|_| syntax(line, "int constant out of range"))?,
                )
            }
        };
        let two_words = matches!(entry, CpEntry::Long(_) | CpEntry::Double(_));
        if two_words != wide {
            return Err(syntax(line, "ldc2_w takes exactly the long and double constants"));
        }
        Ok(self.module.pool.intern(entry))
    }

    fn class_ref(&mut self, args: &[Tok], line: usize) -> Result<u16, JasmError> {
        let name = arg(args, 0, line, "class name")?.text.clone();
        Ok(self.module.pool.intern(CpEntry::Class(name)))
    }

    fn inst(&mut self, body: &mut Body, toks: &[Tok], line: usize) -> Result<(), JasmError> {
        let name = &toks[0].text;
        let op = opcode_by_name(name).ok_or_else(|| JasmError::UnknownInstruction {
            line,
            name: name.clone(),
        })?;
        let args = &toks[1..];
        let pc = body.pc();
        match op {
            BIPUSH => {
                let v = int_arg(args, 0, line, "byte")?;
                let v = i8::try_from(v).map_err(|_| syntax(line, "bipush operand out of range"))?;
                body.code.extend_from_slice(&[op, v as u8]);
            }
            SIPUSH => {
                let v = int_arg(args, 0, line, "short")?;
                let v = i16::try_from(v).map_err(|_| syntax(line, "sipush operand out of range"))?;
                body.code.push(op);
                body.u2(v as u16);
            }
            LDC | LDC_W => {
                let cp = self.constant(args, false, line)?;
                if op == LDC && cp <= 0xff {
                    body.code.extend_from_slice(&[LDC, cp as u8]);
                } else {
                    body.code.push(LDC_W);
                    body.u2(cp);
                }
            }
            LDC2_W => {
                let cp = self.constant(args, true, line)?;
                body.code.push(op);
                body.u2(cp);
            }
            ILOAD..=ALOAD | ISTORE..=ASTORE | RET => {
                let idx = int_arg(args, 0, line, "local index")?;
                let idx = u16::try_from(idx).map_err(|_| syntax(line, "local index out of range"))?;
                body.note_local(idx as usize, local_width(op));
                if idx > 0xff {
                    body.code.extend_from_slice(&[WIDE, op]);
                    body.u2(idx);
                } else {
                    body.code.extend_from_slice(&[op, idx as u8]);
                }
            }
            IINC => {
                let idx = int_arg(args, 0, line, "local index")?;
                let idx = u16::try_from(idx).map_err(|_| syntax(line, "local index out of range"))?;
                let delta = int_arg(args, 1, line, "increment")?;
                let delta = i16::try_from(delta).map_err(|_| syntax(line, "increment out of range"))?;
                body.note_local(idx as usize, 1);
                match i8::try_from(delta) {
                    Ok(d) if idx <= 0xff => body.code.extend_from_slice(&[op, idx as u8, d as u8]),
                    _ => {
                        body.code.extend_from_slice(&[WIDE, op]);
                        body.u2(idx);
                        body.u2(delta as u16);
                    }
                }
            }
            IFEQ..=JSR | IFNULL | IFNONNULL | GOTO_W | JSR_W => {
                let label = arg(args, 0, line, "label")?;
                body.code.push(op);
                body.branch(label, pc, matches!(op, GOTO_W | JSR_W), line);
            }
            TABLESWITCH => {
                let low = int_arg(args, 0, line, "low key")? as i32;
                let default = arg(args, 1, line, "default label")?;
                let targets = &args[2..];
                if targets.is_empty() {
                    return Err(syntax(line, "tableswitch without targets"));
                }
                body.code.push(op);
                while body.code.len() % 4 != 0 {
                    body.code.push(0);
                }
                body.branch(default, pc, true, line);
                body.s4(low);
                body.s4(low + targets.len() as i32 - 1);
                for t in targets {
                    body.branch(t, pc, true, line);
                }
            }
            LOOKUPSWITCH => {
                let default = arg(args, 0, line, "default label")?;
                let mut pairs = Vec::new();
                for t in &args[1..] {
                    let (key, label) = t
                        .text
                        .split_once(':')
                        .ok_or_else(|| syntax(line, format!("expected key:label, found '{}'", t.text)))?;
                    let key = parse_int(key)
                        .and_then(|k| i32::try_from(k).ok())
                        .ok_or_else(|| syntax(line, format!("bad key '{key}'")))?;
                    pairs.push((
                        key,
                        Tok {
                            text: label.to_string(),
                            quoted: false,
                        },
                    ));
                }
                pairs.sort_by_key(|p| p.0);
                body.code.push(op);
                while body.code.len() % 4 != 0 {
                    body.code.push(0);
                }
                body.branch(default, pc, true, line);
                body.s4(pairs.len() as i32);
                for (key, label) in &pairs {
                    body.s4(*key);
                    body.branch(label, pc, true, line);
                }
            }
            GETSTATIC..=PUTFIELD => {
                let (class, name, _) = split_member(&arg(args, 0, line, "field")?.text, line)?;
                let desc = arg(args, 1, line, "field descriptor")?.text.clone();
                let cp = self.module.pool.intern(CpEntry::Field { class, name, desc });
                body.code.push(op);
                body.u2(cp);
            }
            INVOKEVIRTUAL..=INVOKEINTERFACE => {
                let (class, name, desc) =
                    split_member(&arg(args, 0, line, "method")?.text, line)?;
                let desc = desc.ok_or_else(|| syntax(line, "missing method descriptor"))?;
                let (params, _) = parse_method_descriptor(&desc)
                    .ok_or_else(|| syntax(line, format!("bad method descriptor '{desc}'")))?;
                let cp = self.module.pool.intern(CpEntry::Method { class, name, desc });
                body.code.push(op);
                body.u2(cp);
                if op == INVOKEINTERFACE {
                    let count: usize = 1 + params.iter().map(|t| t.slots()).sum::<usize>();
                    body.code.extend_from_slice(&[count as u8, 0]);
                }
            }
            NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => {
                let cp = self.class_ref(args, line)?;
                body.code.push(op);
                body.u2(cp);
            }
            NEWARRAY => {
                let t = arg(args, 0, line, "element type")?;
                let atype = atype_of(&t.text)
                    .ok_or_else(|| syntax(line, format!("bad array type '{}'", t.text)))?;
                body.code.extend_from_slice(&[op, atype]);
            }
            MULTIANEWARRAY => {
                let cp = self.class_ref(args, line)?;
                let dims = int_arg(args, 1, line, "dimensions")?;
                let dims = u8::try_from(dims)
                    .ok()
                    .filter(|&d| d > 0)
                    .ok_or_else(|| syntax(line, "bad dimension count"))?;
                body.code.push(op);
                body.u2(cp);
                body.code.push(dims);
            }
            INVOKEDYNAMIC | WIDE => {
                return Err(syntax(line, format!("'{name}' cannot be assembled")));
            }
            _ => {
                if !args.is_empty() {
                    return Err(syntax(line, format!("'{name}' takes no operands")));
                }
                if let Some((idx, width)) = short_local(op) {
                    body.note_local(idx, width);
                }
                body.code.push(op);
            }
        }
        Ok(())
    }
}
