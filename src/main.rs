fn main() -> anyhow::Result<()> {
    station_ledger_lib::run()
}
