use std::fmt;

use nst_isa::{MEM_OPERAND_SIZE, Opcode, OperandForm, Register, Width};

use crate::value::ResolvableValue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    None,
    Register(Register),
    Immediate {
        value: ResolvableValue,
        /// Width fixed by a source annotation. When set, the encoding is
        /// pinned to this width instead of being inferred from the value.
        width: Option<Width>,
    },
    Memory {
        base: Option<Register>,
        index: Option<Register>,
        scale: u8,
        displacement: ResolvableValue,
    },
}

impl Operand {
    /// An immediate with no width annotation.
    pub fn immediate(value: ResolvableValue) -> Self {
        Self::Immediate { value, width: None }
    }

    /// An immediate pinned to an annotated width.
    pub fn immediate_with_width(value: ResolvableValue, width: Width) -> Self {
        Self::Immediate {
            value,
            width: Some(width),
        }
    }
}

/// One instruction under layout. The opcode is reassigned as narrowing and
/// promotion pick different encodings for the same operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dst: Operand,
    pub src: Operand,
}

/// Kind of a value-carrying field within an instruction encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Absolute immediate or memory displacement.
    Immediate,
    /// Displacement measured from the end of the instruction.
    Relative,
}

/// Byte position of a value field within its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub offset: usize,
    pub width: Width,
    pub kind: FieldKind,
}

impl Instruction {
    pub fn new(opcode: Opcode, dst: Operand, src: Operand) -> Self {
        Self { opcode, dst, src }
    }

    /// Encoded byte count under the current opcode.
    pub fn size(&self) -> usize {
        1 + match self.opcode.form() {
            OperandForm::None => 0,
            OperandForm::Reg | OperandForm::RegReg => 1,
            OperandForm::RegImm(width) => 1 + width.bytes(),
            OperandForm::RegMem | OperandForm::MemReg => 1 + MEM_OPERAND_SIZE,
            OperandForm::MemImm(width) => MEM_OPERAND_SIZE + width.bytes(),
            OperandForm::Imm(width) | OperandForm::Rel(width) => width.bytes(),
            OperandForm::Rim => {
                1 + match &self.dst {
                    Operand::Register(_) => 0,
                    Operand::Memory { .. } => MEM_OPERAND_SIZE,
                    _ => Width::Double.bytes(),
                }
            }
        }
    }

    /// Checks that the operands fit the opcode's form. Layout relies on this
    /// holding, so it runs once up front and the rest of the engine may
    /// assume it.
    pub fn check_shape(&self) -> Result<(), String> {
        let ok = match self.opcode.form() {
            OperandForm::None => {
                matches!(self.src, Operand::None)
                    && match &self.dst {
                        Operand::None => true,
                        Operand::Register(reg) => self.opcode.implied_register() == Some(*reg),
                        _ => false,
                    }
            }
            OperandForm::Reg => {
                matches!(self.dst, Operand::Register(_))
                    && match (&self.src, self.opcode) {
                        (Operand::None, _) => true,
                        (Operand::Immediate { value, .. }, Opcode::CmpZ) => {
                            *value == ResolvableValue::Literal(0)
                        }
                        _ => false,
                    }
            }
            OperandForm::RegReg => {
                matches!(self.dst, Operand::Register(_)) && matches!(self.src, Operand::Register(_))
            }
            OperandForm::RegImm(_) => {
                matches!(self.dst, Operand::Register(_))
                    && matches!(self.src, Operand::Immediate { .. })
            }
            OperandForm::RegMem => {
                matches!(self.dst, Operand::Register(_)) && matches!(self.src, Operand::Memory { .. })
            }
            OperandForm::MemReg => {
                matches!(self.dst, Operand::Memory { .. }) && matches!(self.src, Operand::Register(_))
            }
            OperandForm::MemImm(_) => {
                matches!(self.dst, Operand::Memory { .. })
                    && matches!(self.src, Operand::Immediate { .. })
            }
            OperandForm::Imm(_) | OperandForm::Rel(_) => {
                matches!(self.dst, Operand::Immediate { .. }) && matches!(self.src, Operand::None)
            }
            OperandForm::Rim => {
                matches!(
                    self.dst,
                    Operand::Register(_) | Operand::Memory { .. } | Operand::Immediate { .. }
                ) && matches!(self.src, Operand::None)
            }
        };

        if ok {
            Ok(())
        } else {
            Err(format!(
                "operands do not fit the '{}' form of this instruction",
                self.opcode.mnemonic()
            ))
        }
    }

    /// Visits every value-carrying field of the instruction, in encoding
    /// order, with its byte position. Requires `check_shape` to have passed.
    pub fn for_each_field(&mut self, mut f: impl FnMut(Field, &mut ResolvableValue)) {
        let form = self.opcode.form();
        match form {
            OperandForm::None | OperandForm::Reg | OperandForm::RegReg => {}
            OperandForm::RegImm(width) => {
                let Operand::Immediate { value, .. } = &mut self.src else {
                    unreachable!("shape checked: reg/imm source must be an immediate");
                };
                f(
                    Field {
                        offset: 2,
                        width,
                        kind: FieldKind::Immediate,
                    },
                    value,
                );
            }
            OperandForm::RegMem => {
                let Operand::Memory { displacement, .. } = &mut self.src else {
                    unreachable!("shape checked: reg/mem source must be a memory operand");
                };
                f(
                    Field {
                        offset: 4,
                        width: Width::Double,
                        kind: FieldKind::Immediate,
                    },
                    displacement,
                );
            }
            OperandForm::MemReg => {
                let Operand::Memory { displacement, .. } = &mut self.dst else {
                    unreachable!("shape checked: mem/reg destination must be a memory operand");
                };
                f(
                    Field {
                        offset: 3,
                        width: Width::Double,
                        kind: FieldKind::Immediate,
                    },
                    displacement,
                );
            }
            OperandForm::MemImm(width) => {
                let Operand::Memory { displacement, .. } = &mut self.dst else {
                    unreachable!("shape checked: mem/imm destination must be a memory operand");
                };
                f(
                    Field {
                        offset: 3,
                        width: Width::Double,
                        kind: FieldKind::Immediate,
                    },
                    displacement,
                );
                let Operand::Immediate { value, .. } = &mut self.src else {
                    unreachable!("shape checked: mem/imm source must be an immediate");
                };
                f(
                    Field {
                        offset: 1 + MEM_OPERAND_SIZE,
                        width,
                        kind: FieldKind::Immediate,
                    },
                    value,
                );
            }
            OperandForm::Imm(width) | OperandForm::Rel(width) => {
                let Operand::Immediate { value, .. } = &mut self.dst else {
                    unreachable!("shape checked: bare immediate form must carry an immediate");
                };
                let kind = if matches!(form, OperandForm::Rel(_)) {
                    FieldKind::Relative
                } else {
                    FieldKind::Immediate
                };
                f(
                    Field {
                        offset: 1,
                        width,
                        kind,
                    },
                    value,
                );
            }
            OperandForm::Rim => match &mut self.dst {
                Operand::Register(_) => {}
                Operand::Memory { displacement, .. } => f(
                    Field {
                        offset: 4,
                        width: Width::Double,
                        kind: FieldKind::Immediate,
                    },
                    displacement,
                ),
                Operand::Immediate { value, .. } => f(
                    Field {
                        offset: 2,
                        width: Width::Double,
                        kind: FieldKind::Immediate,
                    },
                    value,
                ),
                Operand::None => {
                    unreachable!("shape checked: rim form must carry an operand");
                }
            },
        }
    }
}

/// One unit of a module's layout. Instructions and data interleave freely;
/// addresses are assigned by summing sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Component {
    Instruction(Instruction),
    /// Data words of a uniform width, emitted in order.
    InitializedData {
        width: Width,
        values: Vec<ResolvableValue>,
    },
    /// Space reserved and zero-filled in the image. The size must be a
    /// constant expression.
    UninitializedData { size: ResolvableValue },
    /// One component logically repeated `count` times. The count must be a
    /// constant expression; the inner component is resolved once, at the
    /// first copy's position, and its encoding replicated.
    Repetition {
        count: ResolvableValue,
        inner: Box<Component>,
    },
}

impl Component {
    /// Encoded byte count. Constant counts are checked before layout begins,
    /// so evaluation cannot fail here.
    pub fn size(&self) -> usize {
        match self {
            Self::Instruction(instr) => instr.size(),
            Self::InitializedData { width, values } => width.bytes() * values.len(),
            Self::UninitializedData { size } => {
                constant(size).expect("reserved size checked constant before layout") as usize
            }
            Self::Repetition { count, inner } => {
                let count =
                    constant(count).expect("repetition count checked constant before layout");
                count as usize * inner.size()
            }
        }
    }
}

/// Evaluates a count expression that must not depend on any name.
pub fn constant(value: &ResolvableValue) -> Option<u64> {
    value.value().ok().and_then(|v| u64::try_from(v).ok())
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => Ok(()),
            Self::Register(reg) => write!(f, "{}", reg.name()),
            Self::Immediate { value, .. } => write!(f, "{value}"),
            Self::Memory {
                base,
                index,
                scale,
                displacement,
            } => {
                let mut parts = Vec::new();
                if let Some(base) = base {
                    parts.push(base.name().to_string());
                }
                if let Some(index) = index {
                    if *scale == 1 {
                        parts.push(index.name().to_string());
                    } else {
                        parts.push(format!("{}*{scale}", index.name()));
                    }
                }
                if *displacement != ResolvableValue::Literal(0) || parts.is_empty() {
                    parts.push(displacement.to_string());
                }
                write!(f, "[{}]", parts.join(" + "))
            }
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode.mnemonic())?;
        match (&self.dst, &self.src) {
            (Operand::None, _) => Ok(()),
            (dst, Operand::None) => write!(f, " {dst}"),
            (dst, src) => write!(f, " {dst}, {src}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{ResolvableValue, ValueOp};

    fn imm(value: i64) -> Operand {
        Operand::immediate(ResolvableValue::Literal(value))
    }

    #[test]
    fn instruction_sizes_follow_encodings() {
        let add = Instruction::new(Opcode::AddRegImm, Operand::Register(Register::A), imm(100));
        assert_eq!(add.size(), 6);

        let add8 = Instruction::new(Opcode::AddRegImm8, Operand::Register(Register::A), imm(100));
        assert_eq!(add8.size(), 3);

        let jmp = Instruction::new(Opcode::JmpRel32, imm(0), Operand::None);
        assert_eq!(jmp.size(), 5);
        let jmpa = Instruction::new(Opcode::JmpAbs, imm(0), Operand::None);
        assert_eq!(jmpa.size(), 5);

        let push_reg = Instruction::new(Opcode::Push, Operand::Register(Register::I), Operand::None);
        assert_eq!(push_reg.size(), 2);
    }

    #[test]
    fn field_positions_cover_both_mem_imm_fields() {
        let mut store = Instruction::new(
            Opcode::MovMemImm,
            Operand::Memory {
                base: Some(Register::Bp),
                index: None,
                scale: 1,
                displacement: ResolvableValue::Literal(8),
            },
            imm(5),
        );
        let mut fields = Vec::new();
        store.for_each_field(|field, _| fields.push(field));
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].offset, 3);
        assert_eq!(fields[0].width, Width::Double);
        assert_eq!(fields[1].offset, 7);
        assert_eq!(store.size(), 1 + MEM_OPERAND_SIZE + Width::Double.bytes());
    }

    #[test]
    fn shape_check_rejects_mismatched_operands() {
        let bad = Instruction::new(Opcode::AddRegImm, imm(1), imm(2));
        assert!(bad.check_shape().is_err());

        let good = Instruction::new(Opcode::AddRegImm, Operand::Register(Register::B), imm(2));
        assert!(good.check_shape().is_ok());
    }

    #[test]
    fn component_sizes() {
        let data = Component::InitializedData {
            width: Width::Word,
            values: vec![ResolvableValue::Literal(1), ResolvableValue::Literal(2)],
        };
        assert_eq!(data.size(), 4);

        let reserved = Component::UninitializedData {
            size: ResolvableValue::expr(
                ValueOp::Multiply,
                ResolvableValue::Literal(4),
                ResolvableValue::Literal(8),
            ),
        };
        assert_eq!(reserved.size(), 32);

        let rep = Component::Repetition {
            count: ResolvableValue::Literal(3),
            inner: Box::new(Component::InitializedData {
                width: Width::Byte,
                values: vec![ResolvableValue::Literal(0xAA)],
            }),
        };
        assert_eq!(rep.size(), 3);

        let nested = Component::Repetition {
            count: ResolvableValue::Literal(2),
            inner: Box::new(rep),
        };
        assert_eq!(nested.size(), 6);
    }

    #[test]
    fn displays_read_like_assembly() {
        let add = Instruction::new(
            Opcode::AddRegImm,
            Operand::Register(Register::A),
            Operand::immediate(ResolvableValue::name("limit")),
        );
        assert_eq!(add.to_string(), "add a, limit");

        let load = Instruction::new(
            Opcode::MovRegMem,
            Operand::Register(Register::B),
            Operand::Memory {
                base: Some(Register::Bp),
                index: Some(Register::I),
                scale: 4,
                displacement: ResolvableValue::Literal(8),
            },
        );
        assert_eq!(load.to_string(), "mov b, [bp + i*4 + 8]");
    }
}
