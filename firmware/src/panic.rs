use core::panic::PanicInfo;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    defmt::error!("box halted: {}", defmt::Display2Format(info));
    // no task may touch a pin after this point
    cortex_m::interrupt::disable();
    loop {
        cortex_m::asm::wfi();
    }
}
