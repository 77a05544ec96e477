//! The closed set of bytecode instructions the compiler knows by name.

macro_rules! opcodes {
    ($($variant:ident = $name:literal / $operands:literal,)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($variant,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $name,)*
                }
            }

            /// Operand words following the opcode word.
            pub fn operands(self) -> u32 {
                match self {
                    $(Opcode::$variant => $operands,)*
                }
            }
        }
    };
}

opcodes! {
    Nop = "nop" / 0,
    Getlocal = "getlocal" / 2,
    Setlocal = "setlocal" / 2,
    Getblockparam = "getblockparam" / 2,
    Setblockparam = "setblockparam" / 2,
    Getblockparamproxy = "getblockparamproxy" / 2,
    Getspecial = "getspecial" / 2,
    Setspecial = "setspecial" / 1,
    Getinstancevariable = "getinstancevariable" / 2,
    Setinstancevariable = "setinstancevariable" / 2,
    Getclassvariable = "getclassvariable" / 2,
    Setclassvariable = "setclassvariable" / 2,
    OptGetconstantPath = "opt_getconstant_path" / 1,
    Getconstant = "getconstant" / 1,
    Setconstant = "setconstant" / 1,
    Getglobal = "getglobal" / 1,
    Setglobal = "setglobal" / 1,
    Putnil = "putnil" / 0,
    Putself = "putself" / 0,
    Putobject = "putobject" / 1,
    Putspecialobject = "putspecialobject" / 1,
    Putstring = "putstring" / 1,
    Concatstrings = "concatstrings" / 1,
    Anytostring = "anytostring" / 0,
    Toregexp = "toregexp" / 2,
    Intern = "intern" / 0,
    Newarray = "newarray" / 1,
    Newarraykwsplat = "newarraykwsplat" / 1,
    Duparray = "duparray" / 1,
    Duphash = "duphash" / 1,
    Expandarray = "expandarray" / 2,
    Concatarray = "concatarray" / 0,
    Splatarray = "splatarray" / 1,
    Newhash = "newhash" / 1,
    Newrange = "newrange" / 1,
    Pop = "pop" / 0,
    Dup = "dup" / 0,
    Dupn = "dupn" / 1,
    Swap = "swap" / 0,
    OptReverse = "opt_reverse" / 1,
    Topn = "topn" / 1,
    Setn = "setn" / 1,
    Adjuststack = "adjuststack" / 1,
    Defined = "defined" / 3,
    Checkmatch = "checkmatch" / 1,
    Checkkeyword = "checkkeyword" / 2,
    Checktype = "checktype" / 1,
    Defineclass = "defineclass" / 3,
    Definemethod = "definemethod" / 2,
    Definesmethod = "definesmethod" / 2,
    Send = "send" / 2,
    OptSendWithoutBlock = "opt_send_without_block" / 1,
    Objtostring = "objtostring" / 1,
    OptStrFreeze = "opt_str_freeze" / 2,
    OptNilP = "opt_nil_p" / 1,
    OptStrUminus = "opt_str_uminus" / 2,
    OptNewarrayMax = "opt_newarray_max" / 1,
    OptNewarrayMin = "opt_newarray_min" / 1,
    Invokesuper = "invokesuper" / 2,
    Invokeblock = "invokeblock" / 1,
    Leave = "leave" / 0,
    Throw = "throw" / 1,
    Jump = "jump" / 1,
    Branchif = "branchif" / 1,
    Branchunless = "branchunless" / 1,
    Branchnil = "branchnil" / 1,
    Once = "once" / 2,
    OptCaseDispatch = "opt_case_dispatch" / 2,
    OptPlus = "opt_plus" / 1,
    OptMinus = "opt_minus" / 1,
    OptMult = "opt_mult" / 1,
    OptDiv = "opt_div" / 1,
    OptMod = "opt_mod" / 1,
    OptEq = "opt_eq" / 1,
    OptNeq = "opt_neq" / 2,
    OptLt = "opt_lt" / 1,
    OptLe = "opt_le" / 1,
    OptGt = "opt_gt" / 1,
    OptGe = "opt_ge" / 1,
    OptLtlt = "opt_ltlt" / 1,
    OptAnd = "opt_and" / 1,
    OptOr = "opt_or" / 1,
    OptAref = "opt_aref" / 1,
    OptAset = "opt_aset" / 1,
    OptAsetWith = "opt_aset_with" / 2,
    OptArefWith = "opt_aref_with" / 2,
    OptLength = "opt_length" / 1,
    OptSize = "opt_size" / 1,
    OptEmptyP = "opt_empty_p" / 1,
    OptSucc = "opt_succ" / 1,
    OptNot = "opt_not" / 1,
    OptRegexpmatch2 = "opt_regexpmatch2" / 1,
    Invokebuiltin = "invokebuiltin" / 1,
    OptInvokebuiltinDelegate = "opt_invokebuiltin_delegate" / 2,
    OptInvokebuiltinDelegateLeave = "opt_invokebuiltin_delegate_leave" / 2,
    GetlocalWc0 = "getlocal_WC_0" / 1,
    GetlocalWc1 = "getlocal_WC_1" / 1,
    SetlocalWc0 = "setlocal_WC_0" / 1,
    SetlocalWc1 = "setlocal_WC_1" / 1,
    PutobjectInt2fix0 = "putobject_INT2FIX_0_" / 0,
    PutobjectInt2fix1 = "putobject_INT2FIX_1_" / 0,
}

impl Opcode {
    pub const COUNT: usize = Opcode::ALL.len();

    pub fn from_index(index: usize) -> Option<Opcode> {
        Opcode::ALL.get(index).copied()
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Instruction length in words.
    pub fn len(self) -> u32 {
        self.operands() + 1
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
