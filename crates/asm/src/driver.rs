use thiserror::Error;

use nst_obj::RelocatableObject;

use crate::component::Component;
use crate::diag::{Diagnostic, render_diagnostics};
use crate::layout::LabelDef;
use crate::resolve::{LibraryDecl, ResolveReport, resolve_module};
use crate::span::{SourceMap, Spanned};
use crate::unify::{Program, compact, unify};

/// One module handed to the back end: components in layout order with their
/// labels and library declarations, plus the sources for rendering
/// diagnostics.
#[derive(Debug, Clone)]
pub struct ModuleInput {
    pub name: String,
    /// Source file the module came from. Library declarations in other
    /// modules are matched against this.
    pub file: String,
    pub components: Vec<Spanned<Component>>,
    pub labels: Vec<LabelDef>,
    pub libraries: Vec<LibraryDecl>,
    pub source_map: SourceMap,
}

#[derive(Debug, Clone)]
pub struct AssembledModule {
    pub object: RelocatableObject,
    pub report: ResolveReport,
}

#[derive(Debug, Clone)]
pub struct AssembledProgram {
    pub program: Program,
    pub reports: Vec<ResolveReport>,
}

#[derive(Debug, Error)]
#[error("assembly failed")]
pub struct AssembleError {
    pub diagnostics: Vec<Diagnostic>,
    pub rendered: String,
}

pub fn assemble_module(module: &mut ModuleInput) -> Result<AssembledModule, AssembleError> {
    resolve_module(
        &module.name,
        Some(&module.file),
        &mut module.components,
        &module.labels,
        &module.libraries,
    )
    .map(|resolved| AssembledModule {
        object: resolved.object,
        report: resolved.report,
    })
    .map_err(|diagnostics| fail_with_rendered(&module.source_map, diagnostics))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramOptions {
    /// Rename modules and symbols to positional ids after unification.
    pub compact_names: bool,
}

/// Assembles every module, then unifies their namespaces. Modules are
/// independent until unification, so all of them are assembled even when an
/// early one fails, and the error carries every module's diagnostics.
pub fn assemble_program(
    modules: &mut [ModuleInput],
    entry: &str,
    options: ProgramOptions,
) -> Result<AssembledProgram, AssembleError> {
    let mut objects = Vec::with_capacity(modules.len());
    let mut reports = Vec::with_capacity(modules.len());
    let mut failed = Vec::new();
    let mut rendered = Vec::new();

    for module in modules.iter_mut() {
        match assemble_module(module) {
            Ok(assembled) => {
                objects.push(assembled.object);
                reports.push(assembled.report);
            }
            Err(error) => {
                rendered.push(error.rendered);
                failed.extend(error.diagnostics);
            }
        }
    }

    if !failed.is_empty() {
        return Err(AssembleError {
            diagnostics: failed,
            rendered: rendered.join("\n"),
        });
    }

    let mut program = unify(objects, entry).map_err(|error| AssembleError {
        diagnostics: Vec::new(),
        rendered: format!("error: {error}"),
    })?;

    if options.compact_names {
        compact(&mut program);
    }

    Ok(AssembledProgram { program, reports })
}

fn fail_with_rendered(source_map: &SourceMap, diagnostics: Vec<Diagnostic>) -> AssembleError {
    let rendered = render_diagnostics(source_map, &diagnostics);
    AssembleError {
        diagnostics,
        rendered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Instruction, Operand};
    use crate::span::{SourceId, Span};
    use crate::value::ResolvableValue;
    use nst_isa::Opcode;

    fn span(index: usize) -> Span {
        Span::new(SourceId(0), index * 10, index * 10 + 8)
    }

    fn instr(index: usize, opcode: Opcode, dst: Operand) -> Spanned<Component> {
        Spanned::new(
            Component::Instruction(Instruction::new(opcode, dst, Operand::None)),
            span(index),
        )
    }

    fn main_module() -> ModuleInput {
        let mut source_map = SourceMap::default();
        source_map.add_source("main.asm", "calla u.helper\nret\n");
        ModuleInput {
            name: "main".to_string(),
            file: "main.asm".to_string(),
            components: vec![
                instr(
                    0,
                    Opcode::CallRel32,
                    Operand::immediate(ResolvableValue::name("u.helper")),
                ),
                instr(1, Opcode::Ret, Operand::None),
            ],
            labels: vec![LabelDef {
                name: "start".to_string(),
                span: span(0),
                component: 0,
            }],
            libraries: vec![LibraryDecl {
                name: "u".to_string(),
                file: "util.asm".to_string(),
                span: span(0),
            }],
            source_map,
        }
    }

    fn util_module() -> ModuleInput {
        let mut source_map = SourceMap::default();
        source_map.add_source("util.asm", "ret\n");
        ModuleInput {
            name: "util".to_string(),
            file: "util.asm".to_string(),
            components: vec![instr(0, Opcode::Ret, Operand::None)],
            labels: vec![LabelDef {
                name: "helper".to_string(),
                span: span(0),
                component: 0,
            }],
            libraries: Vec::new(),
            source_map,
        }
    }

    #[test]
    fn assembles_and_unifies_two_modules() {
        let mut modules = [main_module(), util_module()];
        let assembled =
            assemble_program(&mut modules, "main.start", ProgramOptions::default())
                .expect("assemble");
        assert_eq!(assembled.program.entry, "main.start");

        let main = &assembled.program.objects[0];
        // The provisional 'u' prefix is gone after unification.
        assert_eq!(main.incoming["util.helper"], vec![1]);
        assert_eq!(main.libraries["util"], "util.asm");
        assert_eq!(main.outgoing["start"], 0);
    }

    #[test]
    fn compaction_is_applied_when_requested() {
        let mut modules = [main_module(), util_module()];
        let assembled = assemble_program(
            &mut modules,
            "main.start",
            ProgramOptions {
                compact_names: true,
            },
        )
        .expect("assemble");
        assert_eq!(assembled.program.entry, "0.0");
        assert_eq!(assembled.program.objects[0].incoming["1.0"], vec![1]);
    }

    #[test]
    fn reports_diagnostics_from_every_failing_module() {
        let mut broken_main = main_module();
        broken_main.source_map = SourceMap::default();
        broken_main
            .source_map
            .add_source("main.asm", "calla u.helper\nret\njmp missing\n");
        broken_main.components.push(instr(
            2,
            Opcode::JmpRel32,
            Operand::immediate(ResolvableValue::name("missing")),
        ));
        let mut broken_util = util_module();
        broken_util.source_map = SourceMap::default();
        broken_util
            .source_map
            .add_source("util.asm", "ret\njmp also_missing\n");
        broken_util.components.push(instr(
            1,
            Opcode::JmpRel32,
            Operand::immediate(ResolvableValue::name("also_missing")),
        ));

        let err = assemble_program(
            &mut [broken_main, broken_util],
            "main.start",
            ProgramOptions::default(),
        )
        .expect_err("must fail");
        assert_eq!(err.diagnostics.len(), 2);
        assert!(err.rendered.contains("missing"));
        assert!(err.rendered.contains("also_missing"));
    }

    #[test]
    fn unification_failures_surface_as_errors() {
        let mut modules = [main_module()];
        let err = assemble_program(&mut modules, "main.start", ProgramOptions::default())
            .expect_err("must fail");
        assert!(err.rendered.contains("no module was assembled"));
    }
}
