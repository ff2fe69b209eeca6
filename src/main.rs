use anyhow::Context;

fn main() -> anyhow::Result<()> {
    custodes::run().context("custodes command failed")
}
