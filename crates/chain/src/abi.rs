use alloy::sol;

// ─── Registration / referral contract ───────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract Registration {
        event UserRegistered(
            address indexed user,
            uint256 indexed userId,
            uint256 registrationTime,
            address indexed referrer
        );

        function totalUsers() external view returns (uint256);
        function paused() external view returns (bool);

        function getUserByUserId(uint256 userId) external view returns (
            address userAddress,
            uint256 referrerId,
            address referrerAddress,
            uint256 registrationTime,
            uint256 directReferrals,
            bool isActive,
            string memory fullName
        );

        function getUserInfo(address user) external view returns (
            uint256 userId,
            uint256 referrerId,
            address referrerAddress,
            uint256 registrationTime,
            uint256 directReferrals,
            bool isActive,
            string memory fullName
        );
    }
}

// ─── Matrix slot-purchase contract ──────────────────────────────────────────
sol! {
    #[allow(missing_docs)]
    #[derive(Debug, PartialEq, Eq)]
    #[sol(rpc)]
    contract MatrixPro {
        // === events mirrored into the store ===
        event SlotPurchased(address indexed user, uint256 level, uint256 price);
        event RewardDistributed(
            address indexed user,
            address indexed from,
            uint256 amount,
            uint256 level,
            string incomeType
        );

        // === informational events ===
        event MatrixComplete(address indexed user, uint256 level);
        event Recycled(address indexed user, uint256 level, uint256 recycleCount);
        event SlotPositionUpdated(
            address indexed user,
            uint256 level,
            uint256 position,
            uint256 entryTime
        );
        event SlotsInitialized(address indexed user);
        event EmergencyWithdrawn(address indexed token, uint256 amount);

        // === view functions ===
        function paused() external view returns (bool);

        function getCurrentSlotInfo(address user) external view returns (
            uint256 currentActiveSlot,
            uint256 currentPosition,
            uint256 entryTime,
            uint256 matrixSize,
            uint256 recycleCount,
            uint256 timeInPosition
        );

        function getUserIncomeStats(address user) external view returns (
            uint256 total,
            uint256 levelIncome,
            uint256 directIncome,
            uint256 slotIncome,
            uint256 recycleIncome,
            uint256 salaryIncome
        );

        function getLevelReferralDetails(address user, uint256 level) external view returns (
            uint256 referralCount,
            uint256 recycleCount,
            uint256 slotTransactions,
            bool isUpgraded,
            bool isActive
        );

        function getUserReferralStats(address user) external view returns (
            uint256 totalReferrals,
            uint256 activeReferrals,
            uint256 totalMatrixEntries,
            uint256 activeMatrixPositions,
            uint256 totalRecycles
        );
    }
}
