use anyhow::Result;
use proctest_common::PortAllocator;

/// Reserve `count` ports in one allocator so they are distinct, then print
/// them. The reservations end with this process.
pub fn run(address: &str, start: u16, count: usize) -> Result<i32> {
    let allocator = PortAllocator::new();
    for _ in 0..count {
        let reservation = allocator.reserve(address, start)?;
        println!("{}", reservation.port);
    }
    Ok(0)
}
