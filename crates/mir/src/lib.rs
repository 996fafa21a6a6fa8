pub mod cond;
pub mod function;
pub mod imm;
pub mod inst;
pub mod layout;
pub mod reg;

pub use cond::Cond;
pub use function::{Block, BlockId, CalleeSaved, FrameInfo, Function};
pub use inst::{InstData, InstFlags, InstId, Opcode, Operand};
pub use layout::Layout;
pub use reg::{Reg, RegSet};
