//! Debuggee of the native backend tests.
use std::thread;

struct Point {
    x: i32,
    y: i32,
}

fn add(a: i32, b: i32) -> i32 {
    let s = a + b;
    s
}

fn main() {
    let x = 1;
    let y = add(x, 2);
    let p = Point { x, y };

    let handle = thread::spawn(move || p.x + p.y);
    let sum = handle.join().unwrap_or_default();

    println!("{y} {sum}");
}
