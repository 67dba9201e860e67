//! A self-owned ("fire and forget") timer alongside a periodic one.

use std::time::Duration;

use hrtimer::{Timer, TimerManager};

fn main() {
    let manager = TimerManager::instance();

    let t1 = Timer::new(|| println!("t1 ------ timeout!"));
    t1.arm(Duration::from_micros(1000));

    manager.fire_after(Duration::from_micros(3000), || {
        println!("expired --- timeout!");
    });

    let t3 = Timer::new(|| println!("t3 ------ timeout!"));
    t3.arm_periodic(Duration::from_micros(1000));

    std::thread::sleep(Duration::from_secs(2));
    std::thread::sleep(Duration::from_secs(2));
    std::thread::sleep(Duration::from_secs(2));

    println!("main end");
}
