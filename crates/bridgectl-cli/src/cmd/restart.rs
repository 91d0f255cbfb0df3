use crate::output::print_json;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let controller = super::controller(root)?;
    let outcome = controller.restart()?;

    if json {
        return print_json(&outcome);
    }
    super::stop::print_stop(&outcome.stopped);
    super::start::print_start(&outcome.started);
    Ok(())
}
