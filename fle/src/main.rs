fn main() {
    if let Err(error) = run() {
        libfle::error::report_error_and_exit(&error);
    }
}

fn run() -> libfle::error::Result {
    libfle::init_tracing();
    let driver = libfle::Driver::from_env()?;
    driver.run()
}
