//! CPU program-check exceptions raised by the linkage-stack and
//! cross-memory instructions (spec §7, error family 3).
//!
//! Channel-program checks and unit checks are not modeled as errors here;
//! they are architected outcomes carried inline in [`crate::scsw::ChanStat`]
//! and [`crate::scsw::UnitStatus`] respectively, since the original
//! architecture treats them as status to post, not as something the
//! caller "catches".

use thiserror::Error;

/// A CPU program-check exception code, as raised by the privileged
/// control-transfer instructions implemented in [`crate::lsx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgramCheck {
    #[error("special-operation exception")]
    SpecialOperation,
    #[error("privileged-operation exception")]
    PrivilegedOperation,
    #[error("specification exception")]
    Specification,
    #[error("addressing exception")]
    Addressing,
    #[error("protection exception")]
    Protection,
    #[error("stack-full exception")]
    StackFull,
    #[error("stack-empty exception")]
    StackEmpty,
    #[error("stack-specification exception")]
    StackSpecification,
    #[error("stack-type exception")]
    StackType,
    #[error("stack-operation exception")]
    StackOperation,
    #[error("AFX-translation exception")]
    AfxTranslation,
    #[error("ASX-translation exception")]
    AsxTranslation,
    #[error("LX-translation exception")]
    LxTranslation,
    #[error("EX-translation exception")]
    ExTranslation,
    #[error("ASTE-validity exception")]
    AsteValidity,
    #[error("ASTE-sequence exception")]
    AsteSequence,
    #[error("primary-authority exception")]
    PrimaryAuthority,
    #[error("secondary-authority exception")]
    SecondaryAuthority,
    #[error("PC-translation-specification exception")]
    PcTranslationSpecification,
}

impl ProgramCheck {
    /// The interruption code stored at PSA+X'8E' on a program-check old
    /// PSW store. Values follow the architected exception-code assignment.
    pub fn interruption_code(self) -> u16 {
        match self {
            ProgramCheck::PrivilegedOperation => 0x0002,
            ProgramCheck::Addressing => 0x0005,
            ProgramCheck::Specification => 0x0006,
            ProgramCheck::Protection => 0x0004,
            ProgramCheck::SpecialOperation => 0x0013,
            ProgramCheck::PcTranslationSpecification => 0x001F,
            ProgramCheck::AfxTranslation => 0x0029,
            ProgramCheck::AsxTranslation => 0x002A,
            ProgramCheck::LxTranslation => 0x0027,
            ProgramCheck::ExTranslation => 0x0028,
            ProgramCheck::PrimaryAuthority => 0x0026,
            ProgramCheck::SecondaryAuthority => 0x0030,
            ProgramCheck::AsteValidity => 0x002B,
            ProgramCheck::AsteSequence => 0x002C,
            ProgramCheck::StackFull => 0x0032,
            ProgramCheck::StackEmpty => 0x0033,
            ProgramCheck::StackSpecification => 0x0034,
            ProgramCheck::StackType => 0x0035,
            ProgramCheck::StackOperation => 0x0036,
        }
    }
}
