fn main() -> anyhow::Result<()> {
    profrelay_lib::run()
}
