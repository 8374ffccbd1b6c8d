//! Example: open an ASI stage on a serial port and move it around.

use asistage::{Axis, OpenOptions};
use simple_logger::SimpleLogger;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Enable logging
    SimpleLogger::new().init().unwrap();

    let port_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/ttyUSB0".to_string());

    // Open the port and see where the stage is.
    let driver = OpenOptions::new().open(&port_path)?;
    let x = driver.read_position(Axis::X)?;
    let y = driver.read_position(Axis::Y)?;
    println!("X = {x:.4} mm, Y = {y:.4} mm");

    // Step along X without the poller getting in the way, then take up
    // backlash before settling.
    {
        let _quiet = driver.suppress_polling();
        driver.move_relative_and_wait(Axis::X, 0.5)?;
        driver.correct_backlash(Axis::X, 0.02)?;
    }
    println!("X = {:.4} mm", driver.read_position(Axis::X)?);

    driver.move_absolute_and_wait(Axis::X, x)?;
    driver.disconnect();
    Ok(())
}
