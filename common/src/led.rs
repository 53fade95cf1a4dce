use crate::state::DeviceState;

// Seam for the LED driver collaborator; the bridge only ever hands it
// snapshots. Effect rendering itself lives behind this trait.
pub trait LedRenderer {
    fn render(&mut self, state: &DeviceState);
}
