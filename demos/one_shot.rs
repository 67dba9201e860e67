//! A caller-owned timer armed once, then re-armed before it fires.

use std::time::Duration;

use hrtimer::Timer;

fn main() {
    log::set_max_level(log::LevelFilter::Info);

    let t1 = Timer::new(|| println!("t1 ------ timeout!"));
    t1.rearm(Duration::from_micros(1000));

    let t3 = Timer::new(|| println!("t3 ------ timeout!"));
    t3.arm(Duration::from_micros(1000));

    for _ in 0..3 {
        std::thread::sleep(Duration::from_secs(2));
    }

    println!("main end");
}
