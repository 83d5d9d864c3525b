//! Data dropper; parses and analyzes but emits nothing.

use crate::emitters::{EmitError, Emitter};
use crate::stages::ControlStage;

#[derive(Default)]
pub struct Drop;

impl Emitter for Drop {
    fn process(&mut self, _control: &ControlStage) -> Result<(), EmitError> {
        Ok(())
    }

    fn output(&mut self) -> Result<(), EmitError> {
        Ok(())
    }

    fn check(&self) -> bool {
        true
    }
}
