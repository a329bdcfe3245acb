//! Instruction set of the reference dispatch loop.
//!
//! Operands are register numbers relative to the frame base unless noted.
//! `K[x]` is a constant, `U[x]` an upvalue of the running closure.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    /// R[a] := R[b]
    Move(u8, u8),
    /// R[a] := K[bx]
    LoadK(u8, u32),
    /// R[a] := sbx
    LoadInt(u8, i32),
    /// R[a], ..., R[a+b] := nil
    LoadNil(u8, u8),
    /// R[a] := U[b]
    GetUpval(u8, u8),
    /// U[b] := R[a]
    SetUpval(u8, u8),
    /// R[a] := globals[K[bx]]
    GetGlobal(u8, u32),
    /// globals[K[bx]] := R[a]
    SetGlobal(u8, u32),
    /// R[a] := R[b] + sc
    AddI(u8, u8, i32),
    /// R[a] := R[b] + R[c]
    Add(u8, u8, u8),
    /// if (R[a] == sb) ~= k then pc++
    EqI(u8, i32, bool),
    /// if (not R[a] == k) then pc++
    Test(u8, bool),
    /// pc += sj
    Jmp(i32),
    /// R[a] := closure(P[bx])
    Closure(u8, u32),
    /// R[a], ..., R[a+c-2] := R[a](R[a+1], ..., R[a+b-1]); b == 0 takes
    /// arguments up to top, c == 0 keeps every result.
    Call(u8, u8, u8),
    /// return R[a](R[a+1], ..., R[a+b-1])
    TailCall(u8, u8),
    /// return R[a], ..., R[a+b-2]; b == 0 returns up to top.
    Return(u8, u8),
    /// mark R[a] as to-be-closed
    Tbc(u8),
    /// close upvalues and to-be-closed variables >= R[a]
    Close(u8),
    /// move fixed parameters above the extra arguments (a = fixed count)
    VarargPrep(u8),
    /// R[a], ..., R[a+c-2] := vararg; c == 0 copies all
    Vararg(u8, u8),
}

impl OpCode {
    /// Instructions that take their operand count from `top`.
    pub fn is_in_top(self) -> bool {
        matches!(
            self,
            OpCode::Call(_, 0, _) | OpCode::TailCall(_, 0) | OpCode::Return(_, 0)
        )
    }
}
