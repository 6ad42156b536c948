// Power cuts at every point of an update.  Whatever survives has to keep the
// device in the updater until a complete image has been verified.

use resboot::ledger::{LedgerStore, NvmSlot, RamSlot, RECORD_LEN};
use resboot::protocol::{Command, Response};
use resboot::watchdog::NoWatchdog;
use resboot::{
    BootDecision, Bootloader, Checksum, ChecksumKind, Config, Engine, EntryInputs, EntryReason,
    LedgerStatus, Outcome,
};
use simflash::gen::{GenBuilder, GeneratedImage};
use simflash::styles::STM32F4;
use simflash::SimFlash;
use storage::{Region, SectorDescriptor};

const SLOT_BASE: u32 = 0x0900_0000;
static SLOT_SECTOR: [SectorDescriptor; 1] = [SectorDescriptor::new(SLOT_BASE, 0x400, 0)];

fn config() -> Config {
    Config::new(STM32F4.application, STM32F4.protected())
}

type SimEngine<S> = Engine<SimFlash, S, NoWatchdog>;

fn reboot<S: LedgerStore>(e: SimEngine<S>) -> SimEngine<S> {
    let (flash, store, wdg) = e.into_parts();
    Engine::new(config(), flash, store, wdg).unwrap()
}

fn decide<S: LedgerStore>(e: SimEngine<S>) -> (BootDecision, SimEngine<S>) {
    let boot = Bootloader::start(e, &EntryInputs::default(), 0);
    (boot.decision(), boot.into_engine())
}

fn image(seed: u64) -> GeneratedImage {
    GenBuilder::default().seed(seed).build().unwrap()
}

fn erase<S: LedgerStore>(e: &mut SimEngine<S>, img: &GeneratedImage) {
    let cmd = Command::EraseRegion {
        start: img.base,
        length: img.data.len() as u32,
    };
    assert_eq!(e.execute(cmd, 0), Ok(Response::Ack));
}

fn finish<S: LedgerStore>(e: &mut SimEngine<S>, img: &GeneratedImage) {
    let expected = Checksum::of(ChecksumKind::Crc32, &img.data);
    assert_eq!(
        e.execute(Command::FinalizeAndVerify { expected }, 0),
        Ok(Response::Finalized)
    );
}

fn slot_engine() -> SimEngine<NvmSlot<SimFlash>> {
    let slot = SimFlash::new(&SLOT_SECTOR, 4).unwrap();
    let store = NvmSlot::new(slot, SLOT_SECTOR[0].region()).unwrap();
    Engine::new(config(), STM32F4.build().unwrap(), store, NoWatchdog).unwrap()
}

/// Rebuild the slot from nothing but its flash, as after a reset.
fn slot_reboot(e: SimEngine<NvmSlot<SimFlash>>) -> SimEngine<NvmSlot<SimFlash>> {
    let (flash, store, wdg) = e.into_parts();
    let store = NvmSlot::new(store.into_inner(), SLOT_SECTOR[0].region()).unwrap();
    Engine::new(config(), flash, store, wdg).unwrap()
}

#[test]
fn cut_between_chunks() {
    let img = image(1);
    let chunks: Vec<_> = img.chunks(0x800).collect();
    for cut in 0..=chunks.len() {
        let mut e = Engine::new(config(), STM32F4.build().unwrap(), RamSlot::new(), NoWatchdog)
            .unwrap();
        e.execute(Command::Connect, 0).unwrap();
        erase(&mut e, &img);
        for &(address, data) in &chunks[..cut] {
            e.execute(Command::ProgramChunk { address, data }, 0).unwrap();
        }

        let (decision, e) = decide(reboot(e));
        assert_eq!(
            decision,
            BootDecision::RemainInEngine(EntryReason::UpdateInProgress),
            "cut after {} chunks",
            cut
        );
        let entry = e.ledger();
        assert!(entry.status.is_active());
        assert_eq!(entry.committed, (cut * 0x800) as u32);
    }
}

#[test]
fn cut_during_erase() {
    let img = image(2);
    let flash = STM32F4.build().unwrap().with_latency(4);
    let mut e = Engine::new(config(), flash, RamSlot::new(), NoWatchdog).unwrap();
    e.execute(Command::Connect, 0).unwrap();
    let cmd = Command::EraseRegion {
        start: 0x0800_4000,
        length: 0xc000,
    };
    assert_eq!(e.submit(cmd, 0), Outcome::Pending);
    for _ in 0..6 {
        assert_eq!(e.poll(0), None);
    }
    assert_eq!(e.ledger().status, LedgerStatus::InProgress);

    let (decision, mut e) = decide(reboot(e));
    assert_eq!(
        decision,
        BootDecision::RemainInEngine(EntryReason::UpdateInProgress)
    );
    assert!(!e.is_busy());

    // The host starts over and gets there.
    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &img);
    for (address, data) in img.chunks(0x1000) {
        e.execute(Command::ProgramChunk { address, data }, 0).unwrap();
    }
    finish(&mut e, &img);
    let (decision, _) = decide(reboot(e));
    assert_eq!(
        decision,
        BootDecision::TransferToApplication { base: img.base }
    );
}

#[test]
fn replacing_a_good_image() {
    let old = image(3);
    let new = image(4);
    let mut e = Engine::new(config(), STM32F4.build().unwrap(), RamSlot::new(), NoWatchdog)
        .unwrap();
    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &old);
    e.execute(
        Command::ProgramChunk {
            address: old.base,
            data: &old.data,
        },
        0,
    )
    .unwrap();
    finish(&mut e, &old);

    // The old image is gone as soon as the erase starts.
    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &new);
    let (decision, _) = decide(reboot(e));
    assert_eq!(
        decision,
        BootDecision::RemainInEngine(EntryReason::UpdateInProgress)
    );
}

#[test]
fn ledger_in_flash_survives() {
    let img = image(5);
    let mut e = slot_engine();
    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &img);
    let chunks: Vec<_> = img.chunks(0x1000).collect();
    for &(address, data) in &chunks[..2] {
        e.execute(Command::ProgramChunk { address, data }, 0).unwrap();
    }

    let (decision, mut e) = decide(slot_reboot(e));
    assert_eq!(
        decision,
        BootDecision::RemainInEngine(EntryReason::UpdateInProgress)
    );
    assert_eq!(e.ledger().committed, 0x2000);

    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &img);
    for &(address, data) in &chunks {
        e.execute(Command::ProgramChunk { address, data }, 0).unwrap();
    }
    finish(&mut e, &img);

    let (decision, e) = decide(slot_reboot(e));
    assert_eq!(
        decision,
        BootDecision::TransferToApplication { base: img.base }
    );
    assert!(e.ledger_store().nvm().stats().erases.is_empty());
}

#[test]
fn torn_ledger_record() {
    let img = image(6);
    let mut e = slot_engine();
    e.execute(Command::Connect, 0).unwrap();
    erase(&mut e, &img);
    let (address, data) = img.chunks(0x1000).next().unwrap();
    e.execute(Command::ProgramChunk { address, data }, 0).unwrap();

    // begin, erased, one commit.  The next record was only partly written
    // when power went.
    let (flash, mut store, wdg) = e.into_parts();
    let torn = SLOT_BASE + 3 * RECORD_LEN as u32;
    store.nvm_mut().install(torn, &[0u8; 20]).unwrap();
    let store = NvmSlot::new(store.into_inner(), SLOT_SECTOR[0].region()).unwrap();
    let e = Engine::new(config(), flash, store, wdg).unwrap();

    let entry = e.ledger();
    assert_eq!(entry.status, LedgerStatus::InProgress);
    assert_eq!(entry.committed, 0x1000);
    let (decision, _) = decide(e);
    assert_eq!(
        decision,
        BootDecision::RemainInEngine(EntryReason::UpdateInProgress)
    );
}

#[test]
fn ledger_sector_wraps() {
    let mut e = slot_engine();
    // Six records per update; three updates overflow a sixteen record sector.
    for seed in 10..13 {
        let img = image(seed);
        e.execute(Command::Connect, 0).unwrap();
        erase(&mut e, &img);
        for (address, data) in img.chunks(0x1558) {
            e.execute(Command::ProgramChunk { address, data }, 0).unwrap();
        }
        finish(&mut e, &img);
        e = slot_reboot(e);
    }
    assert_eq!(
        e.ledger_store().nvm().stats().erases,
        vec![SLOT_BASE],
        "slot should have been recycled once"
    );
    let last = image(12);
    assert_eq!(
        e.ledger().checksum,
        Some(Checksum::of(ChecksumKind::Crc32, &last.data))
    );
    let (decision, _) = decide(e);
    assert_eq!(
        decision,
        BootDecision::TransferToApplication { base: last.base }
    );
}

#[test]
fn slot_must_fit_records() {
    let slot = SimFlash::new(&SLOT_SECTOR, 4).unwrap();
    let odd = Region::new(SLOT_BASE, 100);
    assert!(NvmSlot::new(slot, odd).is_err());
}
