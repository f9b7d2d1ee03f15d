//! Layout resolution: assigns addresses to components, narrows instruction
//! encodings to their shortest forms, and records relocations for names that
//! live in other modules.
//!
//! Address assignment and encoding widths depend on each other, so the engine
//! iterates: build an address map from current sizes, resolve every value
//! against it, then narrow whatever now fits a shorter encoding. Narrowing
//! only ever shrinks an instruction, so the total size is non-increasing and
//! the loop terminates.

use indexmap::IndexMap;

use nst_isa::{
    Extend, Opcode, OperandForm, Width, absolute_alias, direct_alias, immediate_aliases,
    immediate_extend, immediate_fits, is_conditional_branch, register_alias, relative_aliases,
    zero_compare_alias,
};
use nst_obj::{ORIGIN_SYMBOL, RelocatableObject};

use crate::component::{Component, FieldKind, Instruction, Operand, constant};
use crate::diag::Diagnostic;
use crate::layout::{AddressMap, LabelDef, LabelTable, build_address_map};
use crate::span::{Span, Spanned};
use crate::value::{HERE, LAST_INSTRUCTION, ResolvableValue, ResolveContext};

/// A library declaration: a provisional name for another module, to be
/// unified against the module assembled from `file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDecl {
    pub name: String,
    pub file: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct ResolveReport {
    /// Number of layout passes until the sizes stabilized.
    pub passes: usize,
    /// Total module size observed at the start of each pass.
    pub pass_sizes: Vec<u64>,
    pub warnings: Vec<Diagnostic>,
}

#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub object: RelocatableObject,
    pub report: ResolveReport,
}

pub fn resolve_module(
    name: &str,
    source: Option<&str>,
    components: &mut [Spanned<Component>],
    label_defs: &[LabelDef],
    libraries: &[LibraryDecl],
) -> Result<ResolvedModule, Vec<Diagnostic>> {
    let labels = LabelTable::build(label_defs, components.len())?;
    validate_structure(components, &labels, libraries)?;

    // Fixed point: sizes only shrink, so this terminates.
    let mut pass_sizes = Vec::new();
    loop {
        let map = build_address_map(components, &labels);
        if let Some(previous) = pass_sizes.last() {
            assert!(
                map.total as u64 <= *previous,
                "layout must not grow between passes"
            );
        }
        pass_sizes.push(map.total as u64);

        unresolve_all(components);
        resolve_pass(components, &map);
        if !narrow_pass(components, &map) {
            break;
        }
    }

    let map = build_address_map(components, &labels);
    let (object, warnings) = emit(name, source, components, &labels, libraries, &map)?;

    Ok(ResolvedModule {
        object,
        report: ResolveReport {
            passes: pass_sizes.len(),
            pass_sizes,
            warnings,
        },
    })
}

fn is_external(name: &str) -> bool {
    name.contains('.')
}

/// One-time checks that do not depend on addresses: operand shapes, constant
/// counts, name validity, and branch targets in other modules. Unconditional
/// worst-case branches to external targets are promoted to absolute forms
/// here, since a relative displacement to another module can never be known.
fn validate_structure(
    components: &mut [Spanned<Component>],
    labels: &LabelTable,
    libraries: &[LibraryDecl],
) -> Result<(), Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    let mut declared: IndexMap<&str, &LibraryDecl> = IndexMap::new();
    for library in libraries {
        if library.name.contains('.') {
            diagnostics.push(Diagnostic::error(
                library.span,
                format!("library name '{}' contains a reserved '.' character", library.name),
            ));
            continue;
        }
        match declared.get(library.name.as_str()) {
            Some(existing) => {
                diagnostics.push(
                    Diagnostic::error(
                        library.span,
                        format!("library '{}' is declared more than once", library.name),
                    )
                    .with_label(existing.span, "first declared here"),
                );
            }
            None => {
                declared.insert(&library.name, library);
            }
        }
    }

    for component in components.iter_mut() {
        validate_component(component.span, &mut component.node, labels, &declared, &mut diagnostics);
    }

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

fn validate_component(
    span: Span,
    component: &mut Component,
    labels: &LabelTable,
    declared: &IndexMap<&str, &LibraryDecl>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let check_names = |value: &ResolvableValue, diagnostics: &mut Vec<Diagnostic>| {
        value.for_each_name(&mut |name| {
            if name == HERE || name == LAST_INSTRUCTION {
                return;
            }
            if let Some((library, symbol)) = name.split_once('.') {
                if library.is_empty() || symbol.is_empty() {
                    diagnostics.push(Diagnostic::error(
                        span,
                        format!("malformed external name '{name}'"),
                    ));
                } else if !declared.contains_key(library) {
                    diagnostics.push(
                        Diagnostic::error(span, format!("unknown library '{library}'"))
                            .with_help("declare the library before referring to its symbols"),
                    );
                }
            } else if !labels.contains(name) {
                diagnostics.push(Diagnostic::error(
                    span,
                    format!("undefined name '{name}'"),
                ));
            }
        });
    };

    match component {
        Component::Instruction(instr) => {
            if let Err(message) = instr.check_shape() {
                diagnostics.push(Diagnostic::error(span, message));
                return;
            }
            for operand in [&instr.dst, &instr.src] {
                if let Operand::Memory { scale, .. } = operand {
                    if !matches!(scale, 1 | 2 | 4 | 8) {
                        diagnostics.push(Diagnostic::error(
                            span,
                            format!("memory scale must be 1, 2, 4 or 8, not {scale}"),
                        ));
                    }
                }
            }
            if let Err(message) = apply_width_annotation(instr) {
                diagnostics.push(Diagnostic::error(span, message));
                return;
            }
            instr.for_each_field(|_, value| check_names(value, diagnostics));

            if let OperandForm::Rel(width) = instr.opcode.form() {
                let mut external_target = false;
                if let Operand::Immediate { value, .. } = &instr.dst {
                    value.for_each_name(&mut |name| external_target |= is_external(name));
                }
                if external_target {
                    if is_conditional_branch(instr.opcode) {
                        diagnostics.push(
                            Diagnostic::error(
                                span,
                                format!(
                                    "conditional branch '{}' cannot target another module",
                                    instr.opcode.mnemonic()
                                ),
                            )
                            .with_help(
                                "branch to a local label and jump to the external target from there",
                            ),
                        );
                    } else if let Some(absolute) = absolute_alias(instr.opcode) {
                        instr.opcode = absolute;
                    } else {
                        diagnostics.push(
                            Diagnostic::error(
                                span,
                                format!(
                                    "{}-byte relative branch cannot reach another module",
                                    width.bytes()
                                ),
                            )
                            .with_help("use the widest relative form and let it promote to absolute"),
                        );
                    }
                }
            }
        }
        Component::InitializedData { values, .. } => {
            for value in values {
                check_names(value, diagnostics);
            }
        }
        Component::UninitializedData { size } => {
            if constant(size).is_none() {
                diagnostics.push(Diagnostic::error(
                    span,
                    format!("reserved size '{size}' must be a non-negative constant"),
                ));
            }
        }
        Component::Repetition { count, inner } => {
            if constant(count).is_none() {
                diagnostics.push(Diagnostic::error(
                    span,
                    format!("repetition count '{count}' must be a non-negative constant"),
                ));
                return;
            }
            validate_component(span, inner, labels, declared, diagnostics);
        }
    }
}

/// Pins an annotated immediate operand to its stated width by selecting the
/// matching family encoding. The opcode handed in must be the one whose
/// family carries that width, or the annotation is an error.
fn apply_width_annotation(instr: &mut Instruction) -> Result<(), String> {
    if let Operand::Immediate {
        width: Some(annotated),
        ..
    } = instr.src
    {
        match instr.opcode.form() {
            OperandForm::RegImm(current) if annotated != current => {
                let alias = immediate_aliases(instr.opcode)
                    .iter()
                    .find(|(_, width)| *width == annotated)
                    .map(|(alias, _)| *alias);
                match alias {
                    Some(alias) => instr.opcode = alias,
                    None => {
                        return Err(format!(
                            "'{}' has no {}-byte immediate encoding",
                            instr.opcode.mnemonic(),
                            annotated.bytes()
                        ));
                    }
                }
            }
            OperandForm::MemImm(current) if annotated != current => {
                return Err(format!(
                    "'{}' takes a fixed {}-byte immediate",
                    instr.opcode.mnemonic(),
                    current.bytes()
                ));
            }
            _ => {}
        }
    }

    if let Operand::Immediate {
        width: Some(annotated),
        ..
    } = instr.dst
    {
        match instr.opcode.form() {
            OperandForm::Rel(current) if annotated != current => {
                let alias = relative_aliases(instr.opcode)
                    .iter()
                    .find(|(_, width)| *width == annotated)
                    .map(|(alias, _)| *alias);
                match alias {
                    Some(alias) => instr.opcode = alias,
                    None => {
                        return Err(format!(
                            "'{}' has no {}-byte relative encoding",
                            instr.opcode.mnemonic(),
                            annotated.bytes()
                        ));
                    }
                }
            }
            OperandForm::Imm(current) if annotated != current => {
                return Err(format!(
                    "'{}' takes a fixed {}-byte operand",
                    instr.opcode.mnemonic(),
                    current.bytes()
                ));
            }
            OperandForm::Rim if annotated != Width::Double => {
                return Err(format!(
                    "'{}' takes a fixed 4-byte immediate operand",
                    instr.opcode.mnemonic()
                ));
            }
            _ => {}
        }
    }

    Ok(())
}

fn unresolve_all(components: &mut [Spanned<Component>]) {
    for component in components.iter_mut() {
        unresolve_component(&mut component.node);
    }
}

fn unresolve_component(component: &mut Component) {
    match component {
        Component::Instruction(instr) => {
            instr.for_each_field(|_, value| value.unresolve());
        }
        Component::InitializedData { values, .. } => {
            for value in values {
                value.unresolve();
            }
        }
        Component::UninitializedData { .. } => {}
        Component::Repetition { inner, .. } => unresolve_component(inner),
    }
}

/// Resolves every value against the given address map. `$` anchors to the
/// end of the field holding the value; `@` anchors to the start of the
/// enclosing instruction, or the most recent one for data components.
fn resolve_pass(components: &mut [Spanned<Component>], map: &AddressMap) {
    let mut instruction_start: Option<i64> = None;
    for (index, component) in components.iter_mut().enumerate() {
        resolve_component(&mut component.node, map.starts[index], map, &mut instruction_start);
    }
}

fn resolve_component(
    component: &mut Component,
    start: i64,
    map: &AddressMap,
    instruction_start: &mut Option<i64>,
) {
    match component {
        Component::Instruction(instr) => {
            *instruction_start = Some(start);
            let anchor = *instruction_start;
            instr.for_each_field(|field, value| {
                value.resolve(&ResolveContext {
                    labels: &map.labels,
                    value_end: start + (field.offset + field.width.bytes()) as i64,
                    instruction_start: anchor,
                });
            });
        }
        Component::InitializedData { width, values } => {
            let anchor = *instruction_start;
            for (i, value) in values.iter_mut().enumerate() {
                value.resolve(&ResolveContext {
                    labels: &map.labels,
                    value_end: start + ((i + 1) * width.bytes()) as i64,
                    instruction_start: anchor,
                });
            }
        }
        Component::UninitializedData { .. } => {}
        Component::Repetition { count, inner } => {
            // The inner component is resolved once, anchored at the first
            // copy; every copy replicates that encoding.
            let copies = constant(count).expect("repetition count checked constant") as i64;
            let copy_size = inner.size() as i64;
            let previous = *instruction_start;
            resolve_component(inner, start, map, instruction_start);
            if copies == 0 {
                // Nothing is emitted, so `@` keeps its prior anchor.
                *instruction_start = previous;
            } else if *instruction_start != previous {
                // The most recent instruction for what follows is the one in
                // the last copy.
                if let Some(anchor) = instruction_start.as_mut() {
                    *anchor += (copies - 1) * copy_size;
                }
            }
        }
    }
}

/// Reassigns opcodes to shorter same-meaning encodings. Returns whether
/// anything changed; every change strictly shrinks the instruction.
fn narrow_pass(components: &mut [Spanned<Component>], map: &AddressMap) -> bool {
    let mut changed = false;
    for (index, component) in components.iter_mut().enumerate() {
        changed |= narrow_component(&mut component.node, map.starts[index]);
    }
    changed
}

fn narrow_component(component: &mut Component, start: i64) -> bool {
    match component {
        Component::Instruction(instr) => narrow_instruction(instr, start),
        // Copies share the first copy's encoding.
        Component::Repetition { inner, .. } => narrow_component(inner, start),
        _ => false,
    }
}

fn narrow_instruction(instr: &mut Instruction, start: i64) -> bool {
    // Single-byte register aliases and direct-immediate forms depend only on
    // the operand shape, so they apply on the first pass.
    if let Operand::Register(reg) = instr.dst {
        if let Some(alias) = register_alias(instr.opcode, reg) {
            instr.opcode = alias;
            return true;
        }
    }
    if matches!(instr.dst, Operand::Immediate { .. }) && instr.opcode.form() == OperandForm::Rim {
        if let Some(alias) = direct_alias(instr.opcode) {
            instr.opcode = alias;
            return true;
        }
    }

    // Zero comparisons drop the immediate field entirely. An annotated width
    // pins the encoding, so it is left alone.
    if zero_compare_alias(instr.opcode).is_some() {
        if let Operand::Immediate { value, width: None } = &instr.src {
            if constant(value) == Some(0) {
                instr.opcode = Opcode::CmpZ;
                instr.src = Operand::immediate(ResolvableValue::Literal(0));
                return true;
            }
        }
    }

    // Immediates that fit a narrower field under the family's extension rule.
    if let Operand::Immediate { value, width: None } = &instr.src {
        if let Ok(resolved) = value.value() {
            let extend = immediate_extend(instr.opcode);
            for (alias, width) in immediate_aliases(instr.opcode) {
                if immediate_fits(*width, extend, resolved) {
                    instr.opcode = *alias;
                    return true;
                }
            }
        }
    }

    // Relative branches whose displacement fits a narrower field. The
    // displacement is anchored at the end of the instruction, so each
    // candidate is checked against its own, shorter size.
    if let OperandForm::Rel(current) = instr.opcode.form() {
        if let Operand::Immediate { value, width: None } = &instr.dst {
            if let Ok(target) = value.value() {
                for (alias, width) in relative_aliases(instr.opcode) {
                    if *width >= current {
                        break;
                    }
                    let candidate_end = start + 1 + width.bytes() as i64;
                    if immediate_fits(*width, Extend::Sign, target - candidate_end) {
                        instr.opcode = *alias;
                        return true;
                    }
                }
            }
        }
    }

    false
}

/// Fit rule for a value field. Instruction immediates follow their family's
/// extension; data words accept anything re-readable at either extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FitRule {
    Extend(Extend),
    Either,
}

impl FitRule {
    fn fits(self, width: Width, value: i64) -> bool {
        match self {
            Self::Extend(extend) => immediate_fits(width, extend, value),
            Self::Either => {
                immediate_fits(width, Extend::Sign, value)
                    || immediate_fits(width, Extend::Zero, value)
            }
        }
    }
}

struct Emitter<'a> {
    code: Vec<u8>,
    incoming: IndexMap<String, Vec<u32>>,
    diagnostics: Vec<Diagnostic>,
    map: &'a AddressMap,
}

impl Emitter<'_> {
    /// Encodes one value field at the current end of the code image. Bare
    /// external names become zero-filled relocation sites; everything else
    /// must evaluate and fit.
    fn field(
        &mut self,
        value: &ResolvableValue,
        width: Width,
        kind: FieldKind,
        rule: FitRule,
        value_end: i64,
        span: Span,
    ) {
        if !value.is_resolved() {
            if let Some(name) = value.as_bare_name() {
                if is_external(name) {
                    if width != Width::Double || kind == FieldKind::Relative {
                        self.diagnostics.push(
                            Diagnostic::error(
                                span,
                                format!(
                                    "external reference '{name}' requires a 4-byte absolute field"
                                ),
                            )
                            .with_note(format!("this field is {} byte(s) wide", width.bytes())),
                        );
                        self.pad(width);
                        return;
                    }
                    self.incoming
                        .entry(name.to_string())
                        .or_default()
                        .push(self.code.len() as u32);
                    self.pad(width);
                    return;
                }
            }

            // `@` is the only local name a resolve pass can leave empty.
            let mut before_any_instruction = false;
            value.for_each_unresolved_name(&mut |name| {
                before_any_instruction |= name == LAST_INSTRUCTION;
            });
            if before_any_instruction {
                self.diagnostics.push(Diagnostic::error(
                    span,
                    "'@' used before any instruction",
                ));
                self.pad(width);
                return;
            }

            match value.external_balance(&is_external) {
                Some(0) => {}
                Some(net) => {
                    self.diagnostics.push(
                        Diagnostic::error(
                            span,
                            format!(
                                "expression '{value}' leaves {} uncancelled external reference(s)",
                                net.abs()
                            ),
                        )
                        .with_note(
                            "external addresses are unknown until link time; they must cancel \
                             out or stand alone in a 4-byte field",
                        ),
                    );
                    self.pad(width);
                    return;
                }
                None => {
                    self.diagnostics.push(Diagnostic::error(
                        span,
                        format!(
                            "expression '{value}' multiplies or divides by an external reference"
                        ),
                    ));
                    self.pad(width);
                    return;
                }
            }
        }

        // Externals that survive to this point cancel to a net of zero, so
        // substituting zero for each of them yields the layout-time value.
        let resolved = match value.value_with_unresolved_zero() {
            Ok(resolved) => resolved,
            Err(err) => {
                self.diagnostics
                    .push(Diagnostic::error(span, format!("cannot evaluate '{value}': {err}")));
                self.pad(width);
                return;
            }
        };

        let encoded = match kind {
            FieldKind::Immediate => resolved,
            FieldKind::Relative => resolved - value_end,
        };
        let fits = match kind {
            FieldKind::Immediate => rule.fits(width, encoded),
            FieldKind::Relative => immediate_fits(width, Extend::Sign, encoded),
        };
        if !fits {
            let what = match kind {
                FieldKind::Immediate => "value",
                FieldKind::Relative => "branch displacement",
            };
            self.diagnostics.push(Diagnostic::error(
                span,
                format!(
                    "{what} {encoded} does not fit in a {}-byte field",
                    width.bytes()
                ),
            ));
            self.pad(width);
            return;
        }

        self.code
            .extend_from_slice(&(encoded as u64).to_le_bytes()[..width.bytes()]);
    }

    fn pad(&mut self, width: Width) {
        let padded = self.code.len() + width.bytes();
        self.code.resize(padded, 0);
    }

    fn memory(
        &mut self,
        base: Option<nst_isa::Register>,
        index: Option<nst_isa::Register>,
        scale: u8,
        displacement: &ResolvableValue,
        field_start: i64,
        span: Span,
    ) {
        let base_nibble = base.map_or(nst_isa::MEM_NO_REGISTER, |reg| reg.encode());
        let index_nibble = index.map_or(nst_isa::MEM_NO_REGISTER, |reg| reg.encode());
        self.code.push(base_nibble << 4 | index_nibble);
        self.code.push(scale);
        self.field(
            displacement,
            Width::Double,
            FieldKind::Immediate,
            FitRule::Extend(Extend::Sign),
            field_start + 2 + Width::Double.bytes() as i64,
            span,
        );
    }

    fn instruction(&mut self, instr: &Instruction, start: i64, span: Span) {
        self.code.push(instr.opcode.byte());
        let extend = immediate_extend(instr.opcode);
        match instr.opcode.form() {
            OperandForm::None => {}
            OperandForm::Reg => {
                let Operand::Register(reg) = instr.dst else {
                    unreachable!("shape checked: reg form destination must be a register");
                };
                self.code.push(reg.encode());
            }
            OperandForm::RegReg => {
                let (Operand::Register(dst), Operand::Register(src)) = (&instr.dst, &instr.src)
                else {
                    unreachable!("shape checked: reg/reg form must carry two registers");
                };
                self.code.push(dst.encode() << 4 | src.encode());
            }
            OperandForm::RegImm(width) => {
                let (Operand::Register(reg), Operand::Immediate { value, .. }) =
                    (&instr.dst, &instr.src)
                else {
                    unreachable!("shape checked: reg/imm form must carry register and immediate");
                };
                self.code.push(reg.encode());
                self.field(
                    value,
                    width,
                    FieldKind::Immediate,
                    FitRule::Extend(extend),
                    start + 2 + width.bytes() as i64,
                    span,
                );
            }
            OperandForm::RegMem => {
                let (Operand::Register(reg), Operand::Memory { base, index, scale, displacement }) =
                    (&instr.dst, &instr.src)
                else {
                    unreachable!("shape checked: reg/mem form must carry register and memory");
                };
                self.code.push(reg.encode());
                self.memory(*base, *index, *scale, displacement, start + 2, span);
            }
            OperandForm::MemReg => {
                let (Operand::Memory { base, index, scale, displacement }, Operand::Register(reg)) =
                    (&instr.dst, &instr.src)
                else {
                    unreachable!("shape checked: mem/reg form must carry memory and register");
                };
                self.memory(*base, *index, *scale, displacement, start + 1, span);
                self.code.push(reg.encode());
            }
            OperandForm::MemImm(width) => {
                let (
                    Operand::Memory { base, index, scale, displacement },
                    Operand::Immediate { value, .. },
                ) = (&instr.dst, &instr.src)
                else {
                    unreachable!("shape checked: mem/imm form must carry memory and immediate");
                };
                self.memory(*base, *index, *scale, displacement, start + 1, span);
                let field_end = start + (1 + nst_isa::MEM_OPERAND_SIZE + width.bytes()) as i64;
                self.field(
                    value,
                    width,
                    FieldKind::Immediate,
                    FitRule::Extend(extend),
                    field_end,
                    span,
                );
            }
            OperandForm::Imm(width) | OperandForm::Rel(width) => {
                let Operand::Immediate { value, .. } = &instr.dst else {
                    unreachable!("shape checked: bare immediate form must carry an immediate");
                };
                let kind = if matches!(instr.opcode.form(), OperandForm::Rel(_)) {
                    FieldKind::Relative
                } else {
                    FieldKind::Immediate
                };
                self.field(
                    value,
                    width,
                    kind,
                    FitRule::Extend(extend),
                    start + 1 + width.bytes() as i64,
                    span,
                );
            }
            OperandForm::Rim => match &instr.dst {
                Operand::Register(reg) => {
                    self.code.push(nst_isa::RIM_REGISTER | reg.encode());
                }
                Operand::Memory {
                    base,
                    index,
                    scale,
                    displacement,
                } => {
                    self.code.push(nst_isa::RIM_MEMORY);
                    self.memory(*base, *index, *scale, displacement, start + 2, span);
                }
                Operand::Immediate { value, .. } => {
                    self.code.push(nst_isa::RIM_IMMEDIATE);
                    self.field(
                        value,
                        Width::Double,
                        FieldKind::Immediate,
                        FitRule::Extend(Extend::Zero),
                        start + 2 + Width::Double.bytes() as i64,
                        span,
                    );
                }
                Operand::None => {
                    unreachable!("shape checked: rim form must carry an operand");
                }
            },
        }
    }

    fn component(&mut self, component: &Component, start: i64, span: Span) {
        match component {
            Component::Instruction(instr) => self.instruction(instr, start, span),
            Component::InitializedData { width, values } => {
                for (i, value) in values.iter().enumerate() {
                    let value_end = start + ((i + 1) * width.bytes()) as i64;
                    self.field(
                        value,
                        *width,
                        FieldKind::Immediate,
                        FitRule::Either,
                        value_end,
                        span,
                    );
                }
            }
            Component::UninitializedData { .. } => {
                let filled = self.code.len() + component.size();
                self.code.resize(filled, 0);
            }
            Component::Repetition { count, inner } => {
                let copies = constant(count).expect("repetition count checked constant");
                let copy_size = inner.size();
                // Every copy emits the first copy's encoding; relocation
                // sites land at each copy's own offset.
                for i in 0..copies {
                    let before = self.diagnostics.len();
                    self.component(inner, start, span);
                    if self.diagnostics.len() > before {
                        // Report once, pad the remaining copies.
                        let remaining = (copies - i - 1) as usize * copy_size;
                        let padded = self.code.len() + remaining;
                        self.code.resize(padded, 0);
                        break;
                    }
                }
            }
        }
    }
}

fn emit(
    name: &str,
    source: Option<&str>,
    components: &mut [Spanned<Component>],
    labels: &LabelTable,
    libraries: &[LibraryDecl],
    map: &AddressMap,
) -> Result<(RelocatableObject, Vec<Diagnostic>), Vec<Diagnostic>> {
    let mut emitter = Emitter {
        code: Vec::with_capacity(map.total as usize),
        incoming: IndexMap::new(),
        diagnostics: Vec::new(),
        map,
    };

    for (index, component) in components.iter().enumerate() {
        let start = emitter.map.starts[index];
        emitter.component(&component.node, start, component.span);

        let emitted = emitter.code.len() as i64;
        let expected = if index + 1 < emitter.map.starts.len() {
            emitter.map.starts[index + 1]
        } else {
            emitter.map.total
        };
        assert_eq!(
            emitted, expected,
            "emitted bytes must match the address map"
        );
    }

    if !emitter.diagnostics.is_empty() {
        return Err(emitter.diagnostics);
    }

    if u32::try_from(emitter.code.len()).is_err() {
        return Err(vec![Diagnostic::error(
            components
                .last()
                .map(|c| c.span)
                .expect("non-empty module"),
            "module image exceeds the 4 GiB address space",
        )]);
    }

    let mut outgoing = IndexMap::new();
    outgoing.insert(ORIGIN_SYMBOL.to_string(), 0u32);
    for (label, _) in labels.iter() {
        outgoing.insert(label.to_string(), map.labels[label] as u32);
    }

    let mut referenced = rustc_hash::FxHashSet::default();
    let mut collect = |name: &str| {
        if let Some((library, _)) = name.split_once('.') {
            referenced.insert(library.to_string());
        }
    };
    for component in components.iter_mut() {
        collect_names(&mut component.node, &mut collect);
    }

    let mut warnings = Vec::new();
    let mut library_table = IndexMap::new();
    for library in libraries {
        if !referenced.contains(&library.name) {
            warnings.push(Diagnostic::warning(
                library.span,
                format!("library '{}' is declared but never referenced", library.name),
            ));
        }
        library_table.insert(library.name.clone(), library.file.clone());
    }

    let object = RelocatableObject {
        name: name.to_string(),
        source: source.map(str::to_string),
        code: emitter.code,
        outgoing,
        incoming: emitter.incoming,
        libraries: library_table,
    };

    Ok((object, warnings))
}

fn collect_names(component: &mut Component, collect: &mut impl FnMut(&str)) {
    match component {
        Component::Instruction(instr) => {
            instr.for_each_field(|_, value| value.for_each_name(&mut *collect));
        }
        Component::InitializedData { values, .. } => {
            for value in values {
                value.for_each_name(collect);
            }
        }
        Component::UninitializedData { .. } => {}
        Component::Repetition { inner, .. } => collect_names(inner, collect),
    }
}
